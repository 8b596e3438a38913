//! Engine host list.
//!
//! Hosts come from a comma separated list (`DOCKER_HOST` or `--docker-host`),
//! each entry optionally labelled: `tcp://10.0.0.5:2375|nas`. The local
//! socket is added when it exists and is not already listed.

use std::path::Path;

/// Local Docker socket address.
pub const LOCAL_SOCKET: &str = "unix:///var/run/docker.sock";

/// One engine host to monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSpec {
    pub url: String,
    pub label: Option<String>,
}

impl HostSpec {
    pub fn new(url: impl Into<String>, label: Option<String>) -> Self {
        Self {
            url: url.into(),
            label,
        }
    }
}

/// Parse a `url[|label],...` list. Blank entries are skipped.
pub fn parse_hosts(value: &str) -> Vec<HostSpec> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once('|') {
            Some((url, label)) => {
                let label = label.trim();
                HostSpec::new(url.trim(), (!label.is_empty()).then(|| label.to_string()))
            }
            None => HostSpec::new(entry, None),
        })
        .collect()
}

/// Append the local socket unless it is listed already.
pub fn with_local_socket(mut hosts: Vec<HostSpec>, socket_exists: bool) -> Vec<HostSpec> {
    if socket_exists && !hosts.iter().any(|h| h.url == LOCAL_SOCKET) {
        hosts.push(HostSpec::new(LOCAL_SOCKET, None));
    }
    hosts
}

/// Hosts to connect to, given the configured list.
pub fn resolve_hosts(configured: Option<&str>) -> Vec<HostSpec> {
    let socket_path = LOCAL_SOCKET.trim_start_matches("unix://");
    with_local_socket(
        parse_hosts(configured.unwrap_or_default()),
        Path::new(socket_path).exists(),
    )
}

/// Label used for a host that reported no name.
pub fn fallback_label(number: usize) -> String {
    format!("Host-{number}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_labelled_hosts() {
        let hosts = parse_hosts(" tcp://10.0.0.5:2375|nas , unix:///run/podman.sock,, tcp://b:2375| ");
        assert_eq!(
            hosts,
            vec![
                HostSpec::new("tcp://10.0.0.5:2375", Some("nas".to_string())),
                HostSpec::new("unix:///run/podman.sock", None),
                HostSpec::new("tcp://b:2375", None),
            ]
        );
    }

    #[test]
    fn test_parse_empty() {
        assert!(parse_hosts("").is_empty());
        assert!(parse_hosts(" , ").is_empty());
    }

    #[test]
    fn test_local_socket_added_once() {
        let hosts = with_local_socket(parse_hosts("tcp://a:2375"), true);
        assert_eq!(hosts.len(), 2);
        assert_eq!(hosts[1].url, LOCAL_SOCKET);

        let hosts = with_local_socket(parse_hosts(LOCAL_SOCKET), true);
        assert_eq!(hosts.len(), 1);

        let hosts = with_local_socket(Vec::new(), false);
        assert!(hosts.is_empty());
    }

    #[test]
    fn test_fallback_label() {
        assert_eq!(fallback_label(2), "Host-2");
    }
}
