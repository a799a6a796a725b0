//! headless_chrome backend for the browser boundary.
//!
//! Tabs are pages. Sub-frames are reached through `contentDocument` from the
//! main document, so cross-origin frames show up in the frame list but fail
//! every operation (and therefore contribute no elements).

use std::ffi::OsStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use headless_chrome::{Browser, LaunchOptions, Tab};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::browser::{BrowserContext, FrameRef, LoadSignals, PageDriver, RawElement};
use crate::config::{BrowserConfig, Timings};
use crate::error::{AgentError, AgentResult};

/// Shared helpers prepended to every script: frame lookup and the interactive-node query.
const PRELUDE: &str = r#"
const ATTR = 'data-ai-index';
const QUERY = 'a, button, input, select, textarea, [role="button"], [role="link"], '
  + '[type="submit"], [type="button"], [onclick], [data-testid]';

function aiFrames() {
  const out = [];
  const walk = (doc) => {
    for (const frame of doc.querySelectorAll('iframe, frame')) {
      let inner = null;
      try { inner = frame.contentDocument; } catch (e) {}
      out.push(inner);
      if (inner) walk(inner);
    }
  };
  walk(document);
  return out;
}

function aiDocument(index) {
  if (index < 0) return document;
  const doc = aiFrames()[index];
  if (!doc) throw new Error('frame ' + index + ' is not accessible');
  return doc;
}

function aiInteractive(doc) {
  const view = doc.defaultView || window;
  return Array.from(doc.querySelectorAll(QUERY)).filter((el) => {
    const s = view.getComputedStyle(el);
    return s.display !== 'none' && s.visibility !== 'hidden' && s.opacity !== '0';
  });
}

function aiTarget(doc, selector) {
  const el = doc.querySelector(selector);
  if (!el) throw new Error('no element matches ' + selector);
  return el;
}
"#;

const LOAD_SIGNALS_JS: &str = r#"
return {
  contentReady: document.readyState !== 'loading',
  resourceCount: performance.getEntriesByType('resource').length,
};
"#;

const FRAME_COUNT_JS: &str = "return aiFrames().length;";

const CLAIM_NAMESPACE_JS: &str = r#"
if (!doc.__aiNamespace) doc.__aiNamespace = args.proposal;
return doc.__aiNamespace;
"#;

const SCAN_JS: &str = r#"
return aiInteractive(doc).map((el) => ({
  tag: el.tagName,
  text: ((el.innerText || el.textContent || '').trim()
    || el.getAttribute('aria-label')
    || el.getAttribute('value')
    || el.getAttribute('placeholder')
    || '').slice(0, 200),
  href: el.tagName === 'A' ? (el.href || '') : '',
  stableId: el.getAttribute(ATTR),
}));
"#;

const ASSIGN_JS: &str = r#"
const nodes = aiInteractive(doc);
for (const [position, id] of args.assignments) {
  const el = nodes[position];
  if (el && !el.hasAttribute(ATTR)) el.setAttribute(ATTR, id);
}
return true;
"#;

const COUNT_JS: &str = "return doc.querySelectorAll(args.selector).length;";

const LINK_TARGET_JS: &str = r#"
const el = doc.querySelector(args.selector);
if (!el || el.tagName !== 'A') return null;
return el.getAttribute('target');
"#;

const CLICK_JS: &str = r#"
const el = aiTarget(doc, args.selector);
el.scrollIntoView({ block: 'center' });
el.click();
return true;
"#;

const FOCUS_JS: &str = r#"
aiTarget(doc, args.selector).focus();
return true;
"#;

const FILL_JS: &str = r#"
const el = aiTarget(doc, args.selector);
const setter = Object.getOwnPropertyDescriptor(Object.getPrototypeOf(el), 'value');
if (setter && setter.set) setter.set.call(el, args.value);
else if ('value' in el) el.value = args.value;
else throw new Error('element cannot be filled');
el.dispatchEvent(new Event('input', { bubbles: true }));
el.dispatchEvent(new Event('change', { bubbles: true }));
return true;
"#;

const SELECT_JS: &str = r#"
const el = aiTarget(doc, args.selector);
if (el.tagName !== 'SELECT') throw new Error('element is not a <select>');
const wanted = String(args.value).trim();
const options = Array.from(el.options);
const option = options.find((o) => o.value === wanted)
  || options.find((o) => o.text.trim() === wanted)
  || options.find((o) => o.text.trim().toLowerCase() === wanted.toLowerCase());
if (!option) throw new Error('no option matches ' + wanted);
el.value = option.value;
option.selected = true;
el.dispatchEvent(new Event('input', { bubbles: true }));
el.dispatchEvent(new Event('change', { bubbles: true }));
return option.value;
"#;

/// Wraps `body` so it runs against one frame's document and always returns a JSON envelope.
fn frame_script(frame: FrameRef, args: &Value, body: &str) -> String {
    let index: i64 = match frame {
        FrameRef::Main => -1,
        FrameRef::Child(i) => i as i64,
    };
    format!(
        "(() => {{\n{PRELUDE}\ntry {{\n  const args = {args};\n  const doc = aiDocument({index});\n  \
         const value = (() => {{\n{body}\n}})();\n  return JSON.stringify({{ ok: true, value }});\n\
         }} catch (e) {{\n  return JSON.stringify({{ ok: false, error: String((e && e.message) || e) }});\n}}\n}})()"
    )
}

const CLEAR_VALUE_FN: &str = "function () { if ('value' in this) { this.value = ''; } }";

/// Typing appends, so a field that could not be cleared is not typed into.
fn clear_then_type(
    clear: impl FnOnce() -> Result<()>,
    type_value: impl FnOnce() -> Result<()>,
) -> Result<()> {
    clear().context("clearing the field before typing")?;
    type_value()
}

#[derive(Deserialize)]
struct Envelope<T> {
    ok: bool,
    value: Option<T>,
    error: Option<String>,
}

/// A launched (or attached) Chrome. Dropping it closes a launched browser.
pub struct ChromeSession {
    browser: Arc<Browser>,
    navigation_timeout: Duration,
}

impl ChromeSession {
    pub async fn launch(config: &BrowserConfig, timings: &Timings) -> AgentResult<Self> {
        let config = config.clone();
        let browser = tokio::task::spawn_blocking(move || launch_browser(&config))
            .await
            .map_err(|e| AgentError::Launch(format!("Browser launch panicked: {}", e)))?
            .map_err(|e| AgentError::Launch(format!("{:#}", e)))?;
        info!("Chrome ready.");
        Ok(Self {
            browser: Arc::new(browser),
            navigation_timeout: timings.navigation_timeout,
        })
    }

    pub fn context(&self) -> Arc<dyn BrowserContext> {
        Arc::new(ChromeContext {
            browser: self.browser.clone(),
            navigation_timeout: self.navigation_timeout,
        })
    }
}

fn launch_browser(config: &BrowserConfig) -> Result<Browser> {
    if let Some(url) = &config.debug_url {
        info!("Attempting to attach to existing Chrome at {}...", url);
        match Browser::connect(url.clone()) {
            Ok(browser) => {
                info!("Attached to existing Chrome.");
                return Ok(browser);
            }
            Err(e) => warn!("Could not attach ({}), launching a new Chrome", e),
        }
    }

    let options = LaunchOptions {
        headless: config.headless,
        path: config.chrome_path.clone(),
        window_size: Some((1280, 800)),
        args: vec![
            OsStr::new("--no-first-run"),
            OsStr::new("--no-default-browser-check"),
            OsStr::new("--disable-blink-features=AutomationControlled"),
            OsStr::new("--disable-infobars"),
        ],
        // The oracle can be slow; the connection must outlive a long decision.
        idle_browser_timeout: Duration::from_secs(600),
        ..Default::default()
    };

    info!("Starting Chrome (headless: {})...", config.headless);
    Browser::new(options).map_err(|e| anyhow!("Browser launch failed: {}", e))
}

pub struct ChromeContext {
    browser: Arc<Browser>,
    navigation_timeout: Duration,
}

#[async_trait]
impl BrowserContext for ChromeContext {
    async fn pages(&self) -> Result<Vec<Arc<dyn PageDriver>>> {
        let tabs = self
            .browser
            .get_tabs()
            .lock()
            .map_err(|_| anyhow!("tab list lock poisoned"))?
            .clone();
        Ok(tabs
            .into_iter()
            .map(|tab| Arc::new(ChromeTab { tab }) as Arc<dyn PageDriver>)
            .collect())
    }

    async fn open(&self, url: &str) -> Result<Arc<dyn PageDriver>> {
        let browser = self.browser.clone();
        let url = url.to_string();
        let navigation_timeout = self.navigation_timeout;
        let tab = tokio::task::spawn_blocking(move || -> Result<Arc<Tab>> {
            let tab = browser.new_tab()?;
            tab.set_default_timeout(navigation_timeout);
            tab.navigate_to(&url)?;
            tab.wait_until_navigated()?;
            Ok(tab)
        })
        .await??;
        Ok(Arc::new(ChromeTab { tab }))
    }
}

pub struct ChromeTab {
    tab: Arc<Tab>,
}

impl ChromeTab {
    /// Runs a synchronous headless_chrome call off the async runtime.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Tab) -> Result<T> + Send + 'static,
    {
        let tab = self.tab.clone();
        tokio::task::spawn_blocking(move || f(tab.as_ref())).await?
    }

    async fn eval<T>(&self, frame: FrameRef, args: Value, body: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let script = frame_script(frame, &args, body);
        self.blocking(move |tab| {
            let result = tab.evaluate(&script, false)?;
            let raw = result
                .value
                .and_then(|v| v.as_str().map(String::from))
                .ok_or_else(|| anyhow!("script returned no value"))?;
            let envelope: Envelope<T> = serde_json::from_str(&raw)?;
            if envelope.ok {
                Ok(envelope.value)
            } else {
                Err(anyhow!(
                    envelope.error.unwrap_or_else(|| "script failed".into())
                ))
            }
        })
        .await
    }

    async fn eval_required<T>(&self, frame: FrameRef, args: Value, body: &str) -> Result<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.eval(frame, args, body)
            .await?
            .ok_or_else(|| anyhow!("script returned null"))
    }
}

#[async_trait]
impl PageDriver for ChromeTab {
    fn id(&self) -> String {
        self.tab.get_target_id().to_string()
    }

    async fn url(&self) -> Result<String> {
        Ok(self.tab.get_url())
    }

    async fn load_signals(&self) -> Result<LoadSignals> {
        self.eval_required(FrameRef::Main, Value::Null, LOAD_SIGNALS_JS)
            .await
    }

    async fn frame_count(&self) -> Result<usize> {
        self.eval_required(FrameRef::Main, Value::Null, FRAME_COUNT_JS)
            .await
    }

    async fn claim_namespace(&self, frame: FrameRef, proposal: &str) -> Result<String> {
        self.eval_required(frame, json!({ "proposal": proposal }), CLAIM_NAMESPACE_JS)
            .await
    }

    async fn scan_interactive(&self, frame: FrameRef) -> Result<Vec<RawElement>> {
        self.eval_required(frame, Value::Null, SCAN_JS).await
    }

    async fn assign_ids(&self, frame: FrameRef, assignments: &[(usize, String)]) -> Result<()> {
        self.eval::<bool>(frame, json!({ "assignments": assignments }), ASSIGN_JS)
            .await?;
        Ok(())
    }

    async fn count_matches(&self, frame: FrameRef, selector: &str) -> Result<usize> {
        self.eval_required(frame, json!({ "selector": selector }), COUNT_JS)
            .await
    }

    async fn link_target(&self, frame: FrameRef, selector: &str) -> Result<Option<String>> {
        self.eval(frame, json!({ "selector": selector }), LINK_TARGET_JS)
            .await
    }

    async fn click(&self, frame: FrameRef, selector: &str) -> Result<()> {
        match frame {
            FrameRef::Main => {
                let selector = selector.to_string();
                self.blocking(move |tab| {
                    tab.find_element(&selector)?.click()?;
                    Ok(())
                })
                .await
            }
            FrameRef::Child(_) => {
                self.eval::<bool>(frame, json!({ "selector": selector }), CLICK_JS)
                    .await?;
                Ok(())
            }
        }
    }

    async fn focus(&self, frame: FrameRef, selector: &str) -> Result<()> {
        self.eval::<bool>(frame, json!({ "selector": selector }), FOCUS_JS)
            .await?;
        Ok(())
    }

    async fn fill(&self, frame: FrameRef, selector: &str, value: &str) -> Result<()> {
        match frame {
            FrameRef::Main => {
                let selector = selector.to_string();
                let value = value.to_string();
                self.blocking(move |tab| {
                    let element = tab.find_element(&selector)?;
                    clear_then_type(
                        || {
                            element.call_js_fn(CLEAR_VALUE_FN, vec![], false)?;
                            Ok(())
                        },
                        || {
                            element.type_into(&value)?;
                            Ok(())
                        },
                    )
                })
                .await
            }
            FrameRef::Child(_) => {
                self.eval::<bool>(
                    frame,
                    json!({ "selector": selector, "value": value }),
                    FILL_JS,
                )
                .await?;
                Ok(())
            }
        }
    }

    async fn select_option(&self, frame: FrameRef, selector: &str, value: &str) -> Result<()> {
        self.eval::<String>(frame, json!({ "selector": selector, "value": value }), SELECT_JS)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_script_targets_the_right_document() {
        let main = frame_script(FrameRef::Main, &Value::Null, COUNT_JS);
        assert!(main.contains("aiDocument(-1)"));
        assert!(main.contains("const args = null;"));

        let child = frame_script(
            FrameRef::Child(2),
            &json!({ "selector": "[data-ai-index=\"ai-f1-0\"]" }),
            COUNT_JS,
        );
        assert!(child.contains("aiDocument(2)"));
        assert!(child.contains(r#"{"selector":"[data-ai-index=\"ai-f1-0\"]"}"#));
    }

    #[test]
    fn failed_clear_skips_typing() {
        let mut typed = false;
        let err = clear_then_type(|| Err(anyhow!("node detached")), || {
            typed = true;
            Ok(())
        })
        .unwrap_err();
        assert!(!typed);
        assert!(format!("{err:#}").contains("node detached"));

        let mut typed = false;
        clear_then_type(|| Ok(()), || {
            typed = true;
            Ok(())
        })
        .unwrap();
        assert!(typed);
    }

    #[test]
    fn envelope_reports_script_errors() {
        let failed: Envelope<usize> =
            serde_json::from_str(r#"{"ok":false,"error":"frame 3 is not accessible"}"#).unwrap();
        assert!(!failed.ok);
        assert_eq!(failed.error.as_deref(), Some("frame 3 is not accessible"));

        let empty: Envelope<Option<String>> = serde_json::from_str(r#"{"ok":true}"#).unwrap();
        assert!(empty.ok);
        assert!(empty.value.is_none());
    }
}
