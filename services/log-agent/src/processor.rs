//! Line processors.
//!
//! A processor receives every framed line of one container and decides when
//! to notify. One processor exists per container name and is reused across
//! restarts of that container, so cooldowns and buffered multi-line entries
//! carry over.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::{Captures, Regex, RegexBuilder};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{AppConfig, KeywordSpec};
use crate::monitor::StopSignal;
use crate::notifier::{Notification, Notifier};

/// A multi-line entry is emitted once no line arrived for this long.
const ENTRY_IDLE_TIMEOUT: Duration = Duration::from_secs(1);

/// How often the flush timer checks the pending entry.
const FLUSH_CHECK_INTERVAL: Duration = Duration::from_millis(250);

/// How long a stopped timer waits for a restarted worker to clear the stop
/// signal before exiting.
const STOP_GRACE: Duration = Duration::from_secs(4);

static ANSI_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;]*m").expect("ANSI escape pattern is valid"));

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{(\w+)\}").expect("placeholder pattern is valid"));

/// Consumer of one container's log lines.
#[async_trait]
pub trait LineProcessor: Send + Sync {
    /// Handle one complete line.
    async fn process_line(&self, line: &str);

    /// Apply a new config snapshot without losing accumulated state.
    async fn load_config(&self, config: Arc<AppConfig>);

    /// Restart background timers after the container's worker restarted.
    async fn resume_flush_timer(&self);
}

/// Builds the processor for a newly monitored container.
pub trait ProcessorFactory: Send + Sync {
    fn create(
        &self,
        container: &str,
        config: Arc<AppConfig>,
        stop: StopSignal,
    ) -> Arc<dyn LineProcessor>;
}

// =============================================================================
// Keyword Processor
// =============================================================================

/// Creates [`KeywordProcessor`]s that report through a shared notifier.
pub struct KeywordProcessorFactory {
    notifier: Arc<dyn Notifier>,
    hostname: Option<String>,
}

impl KeywordProcessorFactory {
    pub fn new(notifier: Arc<dyn Notifier>, hostname: Option<String>) -> Self {
        Self { notifier, hostname }
    }
}

impl ProcessorFactory for KeywordProcessorFactory {
    fn create(
        &self,
        container: &str,
        config: Arc<AppConfig>,
        stop: StopSignal,
    ) -> Arc<dyn LineProcessor> {
        Arc::new(KeywordProcessor::new(
            container,
            config,
            stop,
            self.notifier.clone(),
            self.hostname.clone(),
        ))
    }
}

/// Keyword and regex matcher with cooldowns and multi-line grouping.
pub struct KeywordProcessor {
    inner: Arc<Inner>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    container: String,
    hostname: Option<String>,
    notifier: Arc<dyn Notifier>,
    stop: StopSignal,
    state: Mutex<State>,
}

struct State {
    config: Arc<AppConfig>,
    rules: Rules,
    /// Last notification time per pattern.
    last_hit: HashMap<String, Instant>,
    /// Lines of the multi-line entry being assembled.
    pending: Vec<String>,
    last_update: Instant,
}

impl KeywordProcessor {
    pub fn new(
        container: &str,
        config: Arc<AppConfig>,
        stop: StopSignal,
        notifier: Arc<dyn Notifier>,
        hostname: Option<String>,
    ) -> Self {
        let rules = Rules::compile(container, &config);
        let multi_line = rules.multi_line;

        let inner = Arc::new(Inner {
            container: container.to_string(),
            hostname,
            notifier,
            stop,
            state: Mutex::new(State {
                config,
                rules,
                last_hit: HashMap::new(),
                pending: Vec::new(),
                last_update: Instant::now(),
            }),
        });

        let flush_task = multi_line.then(|| tokio::spawn(flush_loop(inner.clone())));

        Self {
            inner,
            flush_task: Mutex::new(flush_task),
        }
    }

    async fn ensure_flush_timer(&self) {
        let mut task = self.flush_task.lock().await;
        let running = task.as_ref().is_some_and(|t| !t.is_finished());
        if !running {
            debug!(container = %self.inner.container, "Starting flush timer");
            *task = Some(tokio::spawn(flush_loop(self.inner.clone())));
        }
    }
}

impl Drop for KeywordProcessor {
    fn drop(&mut self) {
        if let Some(task) = self.flush_task.get_mut().take() {
            task.abort();
        }
    }
}

#[async_trait]
impl LineProcessor for KeywordProcessor {
    async fn process_line(&self, line: &str) {
        let clean = ANSI_ESCAPE.replace_all(line, "");
        let mut state = self.inner.state.lock().await;

        if !state.rules.multi_line {
            let entry = clean.trim().to_string();
            self.inner.evaluate(&mut state, &entry);
            return;
        }

        // Indented lines continue the entry being assembled.
        let continuation = clean.starts_with([' ', '\t']) && !state.pending.is_empty();
        if !continuation {
            if let Some(entry) = state.take_pending() {
                self.inner.evaluate(&mut state, &entry);
            }
        }
        state.pending.push(clean.into_owned());
        state.last_update = Instant::now();
    }

    async fn load_config(&self, config: Arc<AppConfig>) {
        let multi_line = {
            let mut state = self.inner.state.lock().await;
            let rules = Rules::compile(&self.inner.container, &config);

            // Switching to single-line mode emits whatever was buffered.
            if state.rules.multi_line && !rules.multi_line {
                if let Some(entry) = state.take_pending() {
                    self.inner.evaluate(&mut state, &entry);
                }
            }

            state.rules = rules;
            state.config = config;
            state.rules.multi_line
        };

        debug!(container = %self.inner.container, "Processor config reloaded");

        if multi_line && !self.inner.stop.is_set() {
            self.ensure_flush_timer().await;
        }
    }

    async fn resume_flush_timer(&self) {
        let multi_line = self.inner.state.lock().await.rules.multi_line;
        if multi_line {
            self.ensure_flush_timer().await;
        }
    }
}

impl Inner {
    /// Match one entry against the rules and dispatch a notification.
    fn evaluate(&self, state: &mut State, entry: &str) {
        let now = Instant::now();

        let hits: Vec<&Rule> = state
            .rules
            .keywords
            .iter()
            .filter(|rule| {
                state
                    .last_hit
                    .get(&rule.key)
                    .is_none_or(|last| now.duration_since(*last) >= rule.cooldown)
            })
            .filter(|rule| rule.matcher.is_match(entry))
            .collect();

        if hits.is_empty() {
            return;
        }

        if let Some(excluded) = state.rules.excluded.iter().find(|r| r.matcher.is_match(entry)) {
            debug!(
                container = %self.container,
                excluded = %excluded.label,
                "Match ignored because of excluded keyword"
            );
            return;
        }

        let keywords: Vec<String> = hits.iter().map(|r| r.label.clone()).collect();
        let body = hits
            .iter()
            .find_map(|rule| rule.render(entry))
            .unwrap_or_else(|| entry.to_string());
        let title = format_title(&state.rules.title_template, &self.container, &keywords);

        for key in hits.iter().map(|r| r.key.clone()).collect::<Vec<_>>() {
            state.last_hit.insert(key, now);
        }

        info!(
            container = %self.container,
            keywords = ?keywords,
            "Keywords found in log entry"
        );

        let notification = Notification {
            source: self.container.clone(),
            title,
            body,
            keywords,
            hostname: self.hostname.clone(),
        };
        let notifier = self.notifier.clone();
        let config = state.config.clone();
        tokio::spawn(async move {
            notifier.notify(&config, notification).await;
        });
    }

    /// Emit the pending entry if it has been idle long enough.
    ///
    /// Returns false once multi-line mode is off and the timer can stop.
    async fn flush_if_idle(&self, idle: Duration) -> bool {
        let mut state = self.state.lock().await;
        if state.last_update.elapsed() >= idle {
            if let Some(entry) = state.take_pending() {
                self.evaluate(&mut state, &entry);
            }
        }
        state.rules.multi_line
    }

    async fn flush(&self) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.take_pending() {
            self.evaluate(&mut state, &entry);
        }
    }
}

impl State {
    fn take_pending(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.pending).join("\n"))
    }
}

/// Background timer emitting idle multi-line entries until the container's
/// stop signal stays set for longer than [`STOP_GRACE`].
async fn flush_loop(inner: Arc<Inner>) {
    let mut ticker = tokio::time::interval(FLUSH_CHECK_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = inner.stop.wait() => {
                inner.flush().await;

                let mut stop = inner.stop.subscribe();
                let resumed = matches!(
                    tokio::time::timeout(STOP_GRACE, stop.wait_for(|stopped| !*stopped)).await,
                    Ok(Ok(_))
                );
                if !resumed {
                    break;
                }
            }

            _ = ticker.tick() => {
                if !inner.flush_if_idle(ENTRY_IDLE_TIMEOUT).await {
                    break;
                }
            }
        }
    }

    debug!(container = %inner.container, "Flush timer stopped");
}

// =============================================================================
// Rules
// =============================================================================

struct Rules {
    keywords: Vec<Rule>,
    excluded: Vec<Rule>,
    title_template: String,
    multi_line: bool,
}

struct Rule {
    /// Cooldown key (the raw pattern).
    key: String,
    /// Name reported in titles and payloads.
    label: String,
    matcher: Matcher,
    template: Option<String>,
    cooldown: Duration,
}

enum Matcher {
    /// Lowercased needle, matched case-insensitively.
    Substring(String),
    Regex(Regex),
}

impl Matcher {
    fn is_match(&self, text: &str) -> bool {
        match self {
            Matcher::Substring(needle) => text.to_lowercase().contains(needle),
            Matcher::Regex(re) => re.is_match(text),
        }
    }
}

impl Rules {
    fn compile(container: &str, config: &AppConfig) -> Self {
        let container_config = config.container(container);
        let settings = &config.settings;

        let default_cooldown = container_config
            .and_then(|c| c.notification_cooldown)
            .unwrap_or(settings.notification_cooldown);

        let specs = container_config
            .map(|c| c.keywords.as_slice())
            .unwrap_or_default()
            .iter()
            .chain(config.global_keywords.iter());
        let keywords = specs
            .filter_map(|spec| Rule::compile(container, spec, default_cooldown))
            .collect();

        let excluded = container_config
            .map(|c| c.excluded_keywords.as_slice())
            .unwrap_or_default()
            .iter()
            .filter_map(|spec| Rule::compile(container, spec, 0))
            .collect();

        let title_template = container_config
            .and_then(|c| c.notification_title.clone())
            .unwrap_or_else(|| settings.notification_title.clone());

        Self {
            keywords,
            excluded,
            title_template,
            multi_line: settings.multi_line_entries,
        }
    }
}

impl Rule {
    fn compile(container: &str, spec: &KeywordSpec, default_cooldown: u64) -> Option<Self> {
        let cooldown = Duration::from_secs(spec.cooldown().unwrap_or(default_cooldown));

        match spec {
            KeywordSpec::Plain(keyword) | KeywordSpec::Keyword { keyword, .. } => Some(Self {
                key: keyword.clone(),
                label: keyword.clone(),
                matcher: Matcher::Substring(keyword.to_lowercase()),
                template: None,
                cooldown,
            }),
            KeywordSpec::Regex {
                regex, template, ..
            } => match RegexBuilder::new(regex).case_insensitive(true).build() {
                Ok(re) => Some(Self {
                    key: regex.clone(),
                    label: format!("Regex: {regex}"),
                    matcher: Matcher::Regex(re),
                    template: template.clone(),
                    cooldown,
                }),
                Err(e) => {
                    warn!(container = %container, regex = %regex, error = %e, "Skipping invalid regex");
                    None
                }
            },
        }
    }

    /// Message built from the regex template, if this rule has one.
    fn render(&self, entry: &str) -> Option<String> {
        let (Matcher::Regex(re), Some(template)) = (&self.matcher, &self.template) else {
            return None;
        };
        let captures = re.captures(entry)?;

        let message = PLACEHOLDER.replace_all(template, |placeholder: &Captures| {
            let name = &placeholder[1];
            if name == "original_log_line" {
                return entry.to_string();
            }
            match captures.name(name) {
                Some(value) => value.as_str().to_string(),
                None => placeholder[0].to_string(),
            }
        });
        Some(message.into_owned())
    }
}

/// Notification title from a template, or the default wording.
fn format_title(template: &str, container: &str, keywords: &[String]) -> String {
    let quoted: Vec<String> = keywords.iter().map(|k| format!("'{k}'")).collect();

    if !template.trim().eq_ignore_ascii_case("default") {
        let joined = quoted.join(", ");
        let mut unknown = false;
        let title = PLACEHOLDER.replace_all(template.trim(), |placeholder: &Captures| {
            match &placeholder[1] {
                "container" => container.to_string(),
                "keywords" | "keyword" => joined.clone(),
                _ => {
                    unknown = true;
                    placeholder[0].to_string()
                }
            }
        });
        if !unknown && !title.is_empty() {
            return title.into_owned();
        }
        warn!(template = %template, "Unsupported title template; use {{container}} and {{keywords}}");
    }

    match quoted.as_slice() {
        [] => format!("{container}: no keywords"),
        [one] => format!("{one} found in {container}"),
        [a, b] => format!("{a} and {b} found in {container}"),
        _ => format!(
            "The following keywords were found in {container}: {}",
            quoted.join(", ")
        ),
    }
}

#[cfg(test)]
pub(crate) struct NoopProcessor;

#[cfg(test)]
#[async_trait]
impl LineProcessor for NoopProcessor {
    async fn process_line(&self, _line: &str) {}
    async fn load_config(&self, _config: Arc<AppConfig>) {}
    async fn resume_flush_timer(&self) {}
}
