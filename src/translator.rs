use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::agent::{
    now_ms, ActionKind, ActionRequest, ActionResult, AgentConfig, AgentError, Desktop, Grounder,
    Location, Screenshot, Target,
};

/// Turns one `ActionRequest` into desktop calls and exactly one `ActionResult`.
pub struct ActionTranslator<D: Desktop, G: Grounder> {
    desktop: Arc<D>,
    grounder: G,
    cfg: AgentConfig,
    seq: AtomicU64,
}

impl<D: Desktop, G: Grounder> ActionTranslator<D, G> {
    pub fn new(desktop: Arc<D>, grounder: G, cfg: AgentConfig) -> Self {
        Self { desktop, grounder, cfg, seq: AtomicU64::new(0) }
    }

    fn max_attempts(&self) -> u32 {
        self.cfg.max_step_retries.saturating_add(1)
    }

    /// Fresh screenshot, retried like any other desktop call.
    pub async fn capture(&self) -> Result<Screenshot, AgentError> {
        let (png, _) = self
            .attempt("screenshot", self.cfg.action_timeout, true, || self.desktop.screenshot())
            .await?;
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Screenshot::new(seq, &png))
    }

    /// `Err` only for requests that fail validation; every other failure is
    /// reported inside the returned result.
    pub async fn dispatch(
        &self,
        request: &ActionRequest,
        current: Option<&Screenshot>,
    ) -> Result<ActionResult, AgentError> {
        request.validate()?;
        let kind = request.kind();
        let mut current = current.cloned();

        let outcome = match request {
            ActionRequest::Click { target } => {
                let (x, y) = match self.resolve(target, &mut current).await {
                    Ok(p) => p,
                    Err(e) => return Ok(ActionResult::failed(kind, e, 0)),
                };
                self.attempt("click", self.cfg.action_timeout, true, || self.desktop.click(x, y))
                    .await
                    .map(|((), n)| (format!("clicked at ({x}, {y}){}", describe(target)), n, true))
            }
            ActionRequest::Type { text, target } => {
                let focus = match self.resolve_optional(target.as_ref(), &mut current).await {
                    Ok(p) => p,
                    Err(e) => return Ok(ActionResult::failed(kind, e, 0)),
                };
                self.attempt("type", self.cfg.action_timeout, true, || async move {
                    if let Some((x, y)) = focus {
                        self.desktop.click(x, y).await?;
                    }
                    self.desktop.type_text(text).await
                })
                .await
                .map(|((), n)| (format!("typed {} characters", text.chars().count()), n, true))
            }
            ActionRequest::Key { combo, target } => {
                let focus = match self.resolve_optional(target.as_ref(), &mut current).await {
                    Ok(p) => p,
                    Err(e) => return Ok(ActionResult::failed(kind, e, 0)),
                };
                self.attempt("key", self.cfg.action_timeout, true, || async move {
                    if let Some((x, y)) = focus {
                        self.desktop.click(x, y).await?;
                    }
                    self.desktop.key(combo).await
                })
                .await
                .map(|((), n)| (format!("pressed {combo}"), n, true))
            }
            ActionRequest::Command { command, background } => {
                let background = *background;
                let limit = if background {
                    self.cfg.action_timeout
                } else {
                    self.cfg.command_timeout
                };
                self.attempt("command", limit, false, || self.desktop.run(command, background))
                    .await
                    .map(|(out, n)| {
                        let mut text = out.stdout.trim_end().to_string();
                        if !out.stderr.trim().is_empty() {
                            text.push('\n');
                            text.push_str(out.stderr.trim_end());
                        }
                        if background {
                            (format!("started in background: {command}\n{text}"), n, true)
                        } else {
                            match out.exit_code {
                                Some(0) | None => (text, n, true),
                                // Ran, but exited non-zero: surfaced, not retried.
                                Some(code) => (format!("exit code {code}\n{text}"), n, false),
                            }
                        }
                    })
            }
            // Neither touches the desktop; the next capture shows the effect.
            ActionRequest::Wait { ms } => {
                let wanted = ms.map(Duration::from_millis).unwrap_or(self.cfg.default_wait);
                let waited = wanted.min(self.cfg.max_wait);
                sleep(waited).await;
                debug!(waited_ms = waited.as_millis() as u64, "waited");
                return Ok(no_capture(kind, format!("waited {} ms", waited.as_millis()), 1));
            }
            ActionRequest::Done { summary } => {
                let message = summary.clone().unwrap_or_else(|| "done".into());
                return Ok(no_capture(kind, message, 0));
            }
        };

        let (message, attempts, success) = match outcome {
            Ok(ok) => ok,
            Err(e) => {
                let attempts = match e {
                    AgentError::ActionExecution(_) => self.max_attempts(),
                    _ => 1,
                };
                return Ok(ActionResult::failed(kind, e, attempts));
            }
        };
        Ok(match self.capture_after(kind, attempts).await {
            Ok(shot) => {
                info!(?kind, attempts, success, screenshot = shot.seq, "action dispatched");
                let mut result = ActionResult::succeeded(kind, message, shot, attempts);
                result.success = success;
                result
            }
            Err(r) => r,
        })
    }

    async fn capture_after(
        &self,
        kind: ActionKind,
        attempts: u32,
    ) -> Result<Screenshot, ActionResult> {
        self.capture()
            .await
            .map_err(|e| ActionResult::failed(kind, e, attempts))
    }

    async fn resolve_optional(
        &self,
        target: Option<&Target>,
        current: &mut Option<Screenshot>,
    ) -> Result<Option<(i32, i32)>, AgentError> {
        match target {
            Some(t) => self.resolve(t, current).await.map(Some),
            None => Ok(None),
        }
    }

    async fn resolve(
        &self,
        target: &Target,
        current: &mut Option<Screenshot>,
    ) -> Result<(i32, i32), AgentError> {
        let description = match target {
            Target::Coordinates { x, y } => return Ok((*x, *y)),
            Target::Description(d) => d.trim(),
        };
        let shot = match current.clone() {
            Some(shot) => shot,
            None => {
                let shot = self.capture().await.map_err(|e| {
                    AgentError::GroundingFailed(format!(
                        "no screenshot to ground '{description}': {e}"
                    ))
                })?;
                *current = Some(shot.clone());
                shot
            }
        };
        let located = timeout(self.cfg.action_timeout, self.grounder.locate(&shot, description))
            .await
            .map_err(|_| {
                AgentError::GroundingFailed(format!("grounding '{description}' timed out"))
            })?
            .map_err(|e| AgentError::GroundingFailed(format!("'{description}': {e}")))?;
        let point = located
            .ok_or_else(|| {
                AgentError::GroundingFailed(format!("no element matches '{description}'"))
            })
            .and_then(|loc| self.to_pixels(loc, description))?;
        debug!(description, x = point.0, y = point.1, "grounded");
        Ok(point)
    }

    fn to_pixels(&self, loc: Location, description: &str) -> Result<(i32, i32), AgentError> {
        if !loc.confidence.is_finite() || loc.confidence < self.cfg.min_grounding_confidence {
            return Err(AgentError::GroundingFailed(format!(
                "'{description}' matched with confidence {:.2}, below {:.2}",
                loc.confidence, self.cfg.min_grounding_confidence
            )));
        }
        let in_range = |v: f64| v.is_finite() && (0.0..=1.0).contains(&v);
        if !in_range(loc.x) || !in_range(loc.y) {
            return Err(AgentError::GroundingFailed(format!(
                "'{description}' located outside the screen ({}, {})",
                loc.x, loc.y
            )));
        }
        let (w, h) = self.cfg.display;
        let px = |v: f64, size: u32| {
            ((v * size as f64).round() as i32).clamp(0, size.saturating_sub(1) as i32)
        };
        Ok((px(loc.x, w), px(loc.y, h)))
    }

    /// Runs `op` until it succeeds or the retry bound is spent. Each attempt
    /// gets `limit`; a timeout counts as a failed attempt unless
    /// `retry_timeouts` is false, in which case it is returned as `TimedOut`.
    async fn attempt<T, F, Fut>(
        &self,
        what: &str,
        limit: Duration,
        retry_timeouts: bool,
        mut op: F,
    ) -> Result<(T, u32), AgentError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AgentError>>,
    {
        let max = self.max_attempts();
        let mut last = AgentError::ActionExecution("no attempt made".into());
        for n in 1..=max {
            match timeout(limit, op()).await {
                Ok(Ok(v)) => return Ok((v, n)),
                Ok(Err(e)) => {
                    last = match e {
                        AgentError::ActionExecution(_) => e,
                        other => AgentError::ActionExecution(other.to_string()),
                    };
                }
                Err(_) if !retry_timeouts => {
                    return Err(AgentError::TimedOut(format!(
                        "{what} did not finish within {}s",
                        limit.as_secs()
                    )));
                }
                Err(_) => {
                    last = AgentError::ActionExecution(format!(
                        "{what} timed out after {}s",
                        limit.as_secs()
                    ));
                }
            }
            warn!(what, attempt = n, max, "desktop call failed: {}", last);
        }
        Err(last)
    }
}

fn no_capture(kind: ActionKind, message: String, attempts: u32) -> ActionResult {
    ActionResult {
        kind,
        success: true,
        message,
        screenshot_after: None,
        timestamp_ms: now_ms(),
        attempts,
        error: None,
    }
}

fn describe(target: &Target) -> String {
    match target {
        Target::Description(d) => format!(" on '{d}'"),
        Target::Coordinates { .. } => String::new(),
    }
}
