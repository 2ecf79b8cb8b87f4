//! Playwright browser automation
//!
//! Each session is a Node.js bridge process running Playwright. The engine
//! writes one JSON command per line to the bridge's stdin and reads one JSON
//! reply per line from its stdout, so commands against a session are
//! serialised by construction.

use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command as TokioCommand};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use super::{observed_from_json, Driver, DriverFactory, ElementHandle, Interaction, WaitStatus};
use crate::error::{DriverError, DriverErrorKind, DriverResult, EngineResult};
use crate::model::{MetricKind, Value, WaitCondition};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Browser {
    #[default]
    Chromium,
    Firefox,
    Webkit,
}

impl Browser {
    pub fn as_str(&self) -> &'static str {
        match self {
            Browser::Chromium => "chromium",
            Browser::Firefox => "firefox",
            Browser::Webkit => "webkit",
        }
    }
}

/// Configuration for Playwright sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaywrightConfig {
    /// Base for relative navigation URLs
    pub base_url: String,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub browser: Browser,
    pub headless: bool,
    /// Node.js executable
    pub node_binary: PathBuf,
    /// `node_modules` directory that provides `playwright`
    pub node_path: Option<PathBuf>,
    /// Playwright-side timeout for a single click/fill/read
    pub action_timeout_ms: u64,
    /// How long to wait for the browser to come up
    pub launch_timeout_ms: u64,
}

impl Default for PlaywrightConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            viewport_width: 1280,
            viewport_height: 720,
            browser: Browser::Chromium,
            headless: true,
            node_binary: PathBuf::from("node"),
            node_path: None,
            action_timeout_ms: 2000,
            launch_timeout_ms: 30_000,
        }
    }
}

/// Launches one bridge process per session.
pub struct PlaywrightDriverFactory {
    config: PlaywrightConfig,
    script_path: PathBuf,
    next_id: AtomicUsize,
    // Keeps the bridge script on disk for the factory's lifetime
    _workdir: TempDir,
}

impl PlaywrightDriverFactory {
    /// Verify Playwright is installed and write the bridge script.
    pub fn new(config: PlaywrightConfig) -> EngineResult<Self> {
        check_playwright_installed()?;

        let workdir = tempfile::tempdir()?;
        let script_path = workdir.path().join("bridge.js");
        std::fs::write(&script_path, build_bridge_script(&config))?;
        debug!("Playwright bridge written to {}", script_path.display());

        Ok(Self {
            config,
            script_path,
            next_id: AtomicUsize::new(0),
            _workdir: workdir,
        })
    }
}

#[async_trait]
impl DriverFactory for PlaywrightDriverFactory {
    async fn open_session(&self) -> DriverResult<Box<dyn Driver>> {
        let session_id = format!("pw-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let driver = PlaywrightDriver::launch(session_id, &self.config, &self.script_path).await?;
        Ok(Box::new(driver))
    }
}

/// Check if Playwright is installed
fn check_playwright_installed() -> DriverResult<()> {
    let status = Command::new("npx")
        .args(["playwright", "--version"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    match status {
        Ok(status) if status.success() => Ok(()),
        _ => Err(DriverError::new(
            DriverErrorKind::Unsupported,
            "Playwright not found. Install with: npx playwright install",
        )),
    }
}

/// Bound on each phase of closing a session
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// A live Playwright session
pub struct PlaywrightDriver {
    session_id: String,
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    next_command: u64,
}

impl PlaywrightDriver {
    async fn launch(session_id: String, config: &PlaywrightConfig, script: &std::path::Path) -> DriverResult<Self> {
        let mut cmd = TokioCommand::new(&config.node_binary);
        cmd.arg(script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(node_path) = &config.node_path {
            cmd.env("NODE_PATH", node_path);
        }

        let mut child = cmd.spawn().map_err(|e| {
            DriverError::new(
                DriverErrorKind::SessionClosed,
                format!("Failed to spawn {}: {}", config.node_binary.display(), e),
            )
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| DriverError::protocol("bridge stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DriverError::protocol("bridge stdout unavailable"))?;
        let mut stdout = BufReader::new(stdout).lines();

        let ready = timeout(Duration::from_millis(config.launch_timeout_ms), stdout.next_line())
            .await
            .map_err(|_| {
                DriverError::new(
                    DriverErrorKind::SessionClosed,
                    format!("browser did not start within {} ms", config.launch_timeout_ms),
                )
            })?
            .map_err(io_error)?
            .ok_or_else(|| DriverError::new(DriverErrorKind::SessionClosed, "bridge exited during launch"))?;
        if !ready.contains("\"ready\":true") {
            return Err(DriverError::protocol(format!("unexpected greeting: {}", ready)));
        }

        info!("Playwright session {} ready ({})", session_id, config.browser.as_str());
        Ok(Self {
            session_id,
            child,
            stdin,
            stdout,
            next_command: 0,
        })
    }

    async fn call(&mut self, command: BridgeCommand<'_>) -> DriverResult<serde_json::Value> {
        self.next_command += 1;
        let id = self.next_command;

        let mut line = serde_json::to_string(&Envelope { id, command })
            .map_err(|e| DriverError::protocol(e.to_string()))?;
        trace!("[{}] -> {}", self.session_id, line);
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).await.map_err(io_error)?;
        self.stdin.flush().await.map_err(io_error)?;

        // Replies to commands abandoned by a step timeout arrive first; skip them.
        loop {
            let raw = self
                .stdout
                .next_line()
                .await
                .map_err(io_error)?
                .ok_or_else(|| DriverError::new(DriverErrorKind::Detached, "bridge process exited"))?;
            trace!("[{}] <- {}", self.session_id, raw);

            let reply: Reply = serde_json::from_str(&raw)
                .map_err(|e| DriverError::protocol(format!("invalid reply '{}': {}", raw, e)))?;
            if reply.id < id {
                continue;
            }
            if reply.id > id {
                return Err(DriverError::protocol(format!(
                    "reply {} arrived before command {}",
                    reply.id, id
                )));
            }
            return reply.into_result();
        }
    }
}

#[async_trait]
impl Driver for PlaywrightDriver {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn navigate(&mut self, url: &str) -> DriverResult<()> {
        self.call(BridgeCommand::Navigate { url }).await.map(|_| ())
    }

    async fn locate(&mut self, selector: &str) -> DriverResult<ElementHandle> {
        let id = self.call(BridgeCommand::Locate { selector }).await?;
        let id = id
            .as_str()
            .ok_or_else(|| DriverError::protocol("locate returned no handle"))?;
        Ok(ElementHandle {
            id: id.to_string(),
            selector: selector.to_string(),
        })
    }

    async fn interact(&mut self, handle: &ElementHandle, interaction: Interaction) -> DriverResult<Value> {
        let value = self
            .call(BridgeCommand::Interact {
                handle: &handle.id,
                interaction: &interaction,
            })
            .await?;
        observed_from_json(value)
    }

    async fn read_metric(&mut self, metric: MetricKind) -> DriverResult<Value> {
        let value = self.call(BridgeCommand::Metric { name: metric.as_str() }).await?;
        observed_from_json(value)
    }

    async fn wait_for(&mut self, condition: &WaitCondition, timeout: Duration) -> DriverResult<WaitStatus> {
        let value = self
            .call(BridgeCommand::Wait {
                condition,
                timeout_ms: timeout.as_millis() as u64,
            })
            .await?;
        serde_json::from_value(value).map_err(|e| DriverError::protocol(e.to_string()))
    }

    async fn release(&mut self) -> DriverResult<()> {
        let closed = match timeout(CLOSE_TIMEOUT, self.call(BridgeCommand::Close)).await {
            Ok(closed) => closed,
            Err(_) => Err(DriverError::new(
                DriverErrorKind::SessionClosed,
                format!("bridge did not acknowledge close within {} ms", CLOSE_TIMEOUT.as_millis()),
            )),
        };
        let exited = match &closed {
            Ok(_) => match timeout(CLOSE_TIMEOUT, self.child.wait()).await {
                Ok(Ok(status)) => {
                    debug!("[{}] bridge exited with {}", self.session_id, status);
                    true
                }
                _ => false,
            },
            Err(e) => {
                warn!("[{}] close failed: {}", self.session_id, e);
                false
            }
        };
        if !exited {
            warn!("[{}] bridge did not exit, killing", self.session_id);
            self.child.kill().await.map_err(io_error)?;
        }
        closed.map(|_| ())
    }
}

fn io_error(e: std::io::Error) -> DriverError {
    DriverError::new(DriverErrorKind::Detached, format!("bridge I/O failed: {}", e))
}

#[derive(Debug, Serialize)]
struct Envelope<'a> {
    id: u64,
    #[serde(flatten)]
    command: BridgeCommand<'a>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "camelCase")]
enum BridgeCommand<'a> {
    Navigate {
        url: &'a str,
    },
    Locate {
        selector: &'a str,
    },
    Interact {
        handle: &'a str,
        interaction: &'a Interaction,
    },
    Metric {
        name: &'static str,
    },
    Wait {
        condition: &'a WaitCondition,
        #[serde(rename = "timeoutMs")]
        timeout_ms: u64,
    },
    Close,
}

#[derive(Debug, Deserialize)]
struct Reply {
    id: u64,
    ok: bool,
    #[serde(default)]
    value: serde_json::Value,
    #[serde(default)]
    error: Option<ReplyError>,
}

#[derive(Debug, Deserialize)]
struct ReplyError {
    kind: DriverErrorKind,
    message: String,
}

impl Reply {
    fn into_result(self) -> DriverResult<serde_json::Value> {
        if self.ok {
            return Ok(self.value);
        }
        Err(match self.error {
            Some(e) => DriverError::new(e.kind, e.message),
            None => DriverError::protocol("command failed without an error"),
        })
    }
}

const BRIDGE_TEMPLATE: &str = r#"
const { chromium, firefox, webkit } = require('playwright');
const readline = require('readline');

class DriverFailure extends Error {
  constructor(kind, message) { super(message); this.kind = kind; }
}

const classify = (error) => {
  const text = String((error && error.message) || error);
  if (/net::|NS_ERROR|navigat/i.test(text)) return 'navigationFailed';
  if (/detached|Target closed|has been closed/i.test(text)) return 'detached';
  if (/Timeout|not visible|not enabled|not editable|intercepts pointer/i.test(text)) return 'notInteractable';
  return 'protocol';
};

(async () => {
  const browser = await __BROWSER__.launch({ headless: __HEADLESS__ });
  const context = await browser.newContext({
    viewport: { width: __WIDTH__, height: __HEIGHT__ }
  });
  const page = await context.newPage();
  const baseUrl = __BASE_URL__;
  const actionTimeout = __ACTION_TIMEOUT__;
  const handles = new Map();
  let nextHandle = 0;
  let consoleErrors = 0;
  page.on('console', (msg) => { if (msg.type() === 'error') consoleErrors += 1; });

  const reply = (msg) => process.stdout.write(JSON.stringify(msg) + '\n');

  const metric = async (name) => {
    if (name === 'consoleErrors') return consoleErrors;
    const perf = await page.evaluate(() => {
      const nav = performance.getEntriesByType('navigation')[0];
      const resources = performance.getEntriesByType('resource');
      const paint = performance.getEntriesByName('first-contentful-paint')[0];
      return {
        pageLoadMs: nav ? nav.loadEventEnd - nav.startTime : null,
        domContentLoadedMs: nav ? nav.domContentLoadedEventEnd - nav.startTime : null,
        firstContentfulPaintMs: paint ? paint.startTime : null,
        responseTimeMs: nav ? nav.responseEnd - nav.requestStart : null,
        transferBytes: (nav ? nav.transferSize : 0)
          + resources.reduce((sum, r) => sum + (r.transferSize || 0), 0),
        resourceCount: resources.length,
      };
    });
    const value = perf[name];
    if (value === null || value === undefined) {
      throw new DriverFailure('unsupported', `metric ${name} is not available`);
    }
    return value;
  };

  const wait = async (condition, timeout) => {
    try {
      if (condition.visible !== undefined) {
        await page.waitForSelector(condition.visible, { state: 'visible', timeout });
      } else if (condition.hidden !== undefined) {
        await page.waitForSelector(condition.hidden, { state: 'hidden', timeout });
      } else if (condition.textContains !== undefined) {
        await page.locator(condition.textContains.selector)
          .filter({ hasText: condition.textContains.text })
          .first()
          .waitFor({ state: 'attached', timeout });
      } else if (condition.urlContains !== undefined) {
        await page.waitForURL((url) => url.toString().includes(condition.urlContains), { timeout });
      } else {
        throw new DriverFailure('unsupported', 'unknown wait condition');
      }
      return 'satisfied';
    } catch (error) {
      if (error && error.name === 'TimeoutError') return 'timedOut';
      throw error;
    }
  };

  const handlers = {
    navigate: async (cmd) => {
      await page.goto(new URL(cmd.url, baseUrl).toString());
      return null;
    },
    locate: async (cmd) => {
      const matches = page.locator(cmd.selector);
      if ((await matches.count()) === 0) {
        throw new DriverFailure('elementNotFound', `no element matches '${cmd.selector}'`);
      }
      const id = `h${nextHandle++}`;
      handles.set(id, matches.first());
      return id;
    },
    interact: async (cmd) => {
      const locator = handles.get(cmd.handle);
      if (!locator) throw new DriverFailure('detached', `unknown handle ${cmd.handle}`);
      const interaction = cmd.interaction;
      switch (interaction.kind) {
        case 'click':
          await locator.click({ timeout: actionTimeout });
          return null;
        case 'fill':
          await locator.fill(interaction.value, { timeout: actionTimeout });
          return await locator.inputValue({ timeout: actionTimeout });
        case 'readText':
          return await locator.innerText({ timeout: actionTimeout });
        case 'readValue':
          return await locator.inputValue({ timeout: actionTimeout });
        case 'isVisible':
          return await locator.isVisible();
        default:
          throw new DriverFailure('unsupported', `unknown interaction ${interaction.kind}`);
      }
    },
    metric: async (cmd) => metric(cmd.name),
    wait: async (cmd) => wait(cmd.condition, cmd.timeoutMs),
  };

  reply({ ready: true });
  const lines = readline.createInterface({ input: process.stdin });
  for await (const line of lines) {
    if (!line.trim()) continue;
    const cmd = JSON.parse(line);
    if (cmd.op === 'close') {
      await browser.close();
      reply({ id: cmd.id, ok: true, value: null });
      break;
    }
    try {
      const handler = handlers[cmd.op];
      if (!handler) throw new DriverFailure('unsupported', `unknown op ${cmd.op}`);
      reply({ id: cmd.id, ok: true, value: await handler(cmd) });
    } catch (error) {
      reply({
        id: cmd.id,
        ok: false,
        error: { kind: error.kind || classify(error), message: String((error && error.message) || error) },
      });
    }
  }
  process.exit(0);
})().catch((error) => {
  process.stderr.write(String((error && error.stack) || error) + '\n');
  process.exit(1);
});
"#;

/// Render the bridge script for a configuration
pub fn build_bridge_script(config: &PlaywrightConfig) -> String {
    // serde_json string encoding doubles as a JS string literal
    let base_url = serde_json::Value::String(config.base_url.clone()).to_string();
    BRIDGE_TEMPLATE
        .replace("__BROWSER__", config.browser.as_str())
        .replace("__HEADLESS__", if config.headless { "true" } else { "false" })
        .replace("__WIDTH__", &config.viewport_width.to_string())
        .replace("__HEIGHT__", &config.viewport_height.to_string())
        .replace("__BASE_URL__", &base_url)
        .replace("__ACTION_TIMEOUT__", &config.action_timeout_ms.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bridge_script_substitution() {
        let config = PlaywrightConfig {
            browser: Browser::Firefox,
            headless: false,
            base_url: "http://lms.local/it's".to_string(),
            ..Default::default()
        };
        let script = build_bridge_script(&config);
        assert!(script.contains("await firefox.launch({ headless: false })"));
        assert!(script.contains("viewport: { width: 1280, height: 720 }"));
        assert!(script.contains(r#"const baseUrl = "http://lms.local/it's";"#));
        assert!(!script.contains("__"));
    }

    #[test]
    fn test_command_wire_format() {
        let interaction = Interaction::Fill("student".to_string());
        let line = serde_json::to_string(&Envelope {
            id: 7,
            command: BridgeCommand::Interact {
                handle: "h1",
                interaction: &interaction,
            },
        })
        .unwrap();
        assert_eq!(
            line,
            r#"{"id":7,"op":"interact","handle":"h1","interaction":{"kind":"fill","value":"student"}}"#
        );

        let condition = WaitCondition::Visible("#menu".to_string());
        let line = serde_json::to_string(&Envelope {
            id: 8,
            command: BridgeCommand::Wait { condition: &condition, timeout_ms: 100 },
        })
        .unwrap();
        assert_eq!(line, r##"{"id":8,"op":"wait","condition":{"visible":"#menu"},"timeoutMs":100}"##);
    }

    #[test]
    fn test_reply_mapping() {
        let reply: Reply = serde_json::from_str(
            r#"{"id":3,"ok":false,"error":{"kind":"elementNotFound","message":"no element matches '#x'"}}"#,
        )
        .unwrap();
        let err = reply.into_result().unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::ElementNotFound);

        let reply: Reply = serde_json::from_str(r#"{"id":4,"ok":true,"value":"satisfied"}"#).unwrap();
        let status: WaitStatus = serde_json::from_value(reply.into_result().unwrap()).unwrap();
        assert_eq!(status, WaitStatus::Satisfied);
    }

    #[test]
    fn test_browser_from_config() {
        let config: PlaywrightConfig = toml::from_str("browser = \"webkit\"\nheadless = false").unwrap();
        assert_eq!(config.browser, Browser::Webkit);
        assert!(!config.headless);
        assert_eq!(config.viewport_width, 1280);
        assert!(toml::from_str::<PlaywrightConfig>("browser = \"safari\"").is_err());
    }
}
