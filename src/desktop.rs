use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::process::{Output, Stdio};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::agent::{AgentError, CommandOutput, Desktop};

#[derive(Clone)]
pub struct DesktopConfig {
    pub display: String,
    pub shell: String,
    pub type_delay_ms: u32,
}

impl Default for DesktopConfig {
    fn default() -> Self {
        Self {
            display: std::env::var("DISPLAY").unwrap_or_else(|_| ":0".into()),
            shell: "sh".into(),
            type_delay_ms: 12,
        }
    }
}

/// Desktop backed by an X11 display: `xdotool` for input, ImageMagick
/// `import` for screenshots, the configured shell for commands.
pub struct X11Desktop {
    cfg: DesktopConfig,
    background: Mutex<Vec<Child>>,
}

impl X11Desktop {
    pub fn new(cfg: DesktopConfig) -> Self {
        Self { cfg, background: Mutex::new(Vec::new()) }
    }

    async fn exec(&self, program: &str, args: &[&str]) -> Result<Output> {
        let out = Command::new(program)
            .args(args)
            .env("DISPLAY", &self.cfg.display)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to spawn {program}"))?;
        if !out.status.success() {
            bail!(
                "{} exited with {}: {}",
                program,
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Ok(out)
    }

    pub async fn screenshot_png(&self) -> Result<Vec<u8>> {
        let out = self.exec("import", &["-window", "root", "png:-"]).await?;
        if out.stdout.is_empty() {
            bail!("import produced an empty image");
        }
        Ok(out.stdout)
    }

    pub async fn click_at(&self, x: i32, y: i32) -> Result<()> {
        let (x, y) = (x.to_string(), y.to_string());
        self.exec("xdotool", &["mousemove", "--sync", x.as_str(), y.as_str(), "click", "1"]).await?;
        Ok(())
    }

    pub async fn type_str(&self, text: &str) -> Result<()> {
        let delay = self.cfg.type_delay_ms.to_string();
        self.exec("xdotool", &["type", "--delay", delay.as_str(), "--", text]).await?;
        Ok(())
    }

    pub async fn press(&self, combo: &str) -> Result<()> {
        let keys = normalize_combo(combo);
        self.exec("xdotool", &["key", "--", keys.as_str()]).await?;
        Ok(())
    }

    pub async fn shell(&self, command: &str, background: bool) -> Result<CommandOutput> {
        let mut cmd = Command::new(&self.cfg.shell);
        cmd.arg("-c").arg(command).env("DISPLAY", &self.cfg.display).stdin(Stdio::null());

        if background {
            let child = cmd
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
                .with_context(|| format!("failed to start `{command}`"))?;
            let pid = child.id();
            let mut bg = self.background.lock().await;
            // Reap children that already exited.
            bg.retain_mut(|c| matches!(c.try_wait(), Ok(None)));
            bg.push(child);
            debug!(?pid, running = bg.len(), "background command started");
            return Ok(CommandOutput {
                stdout: pid.map(|p| format!("pid {p}")).unwrap_or_default(),
                stderr: String::new(),
                exit_code: None,
            });
        }

        let out = cmd
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to run `{command}`"))?;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
            exit_code: out.status.code(),
        })
    }
}

/// Maps loosely written combos ("Ctrl+Enter", "cmd+c") onto xdotool keysyms.
pub fn normalize_combo(combo: &str) -> String {
    combo
        .split('+')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(|k| match k.to_ascii_lowercase().as_str() {
            "ctrl" | "control" => "ctrl".to_string(),
            "alt" | "option" => "alt".to_string(),
            "shift" => "shift".to_string(),
            "cmd" | "super" | "win" | "meta" => "super".to_string(),
            "enter" | "return" => "Return".to_string(),
            "esc" | "escape" => "Escape".to_string(),
            "tab" => "Tab".to_string(),
            "space" => "space".to_string(),
            "backspace" => "BackSpace".to_string(),
            "delete" | "del" => "Delete".to_string(),
            "up" => "Up".to_string(),
            "down" => "Down".to_string(),
            "left" => "Left".to_string(),
            "right" => "Right".to_string(),
            "pageup" => "Page_Up".to_string(),
            "pagedown" => "Page_Down".to_string(),
            "home" => "Home".to_string(),
            "end" => "End".to_string(),
            _ => k.to_string(),
        })
        .collect::<Vec<_>>()
        .join("+")
}

fn exec_err(e: anyhow::Error) -> AgentError {
    AgentError::ActionExecution(format!("{e:#}"))
}

#[async_trait]
impl Desktop for X11Desktop {
    async fn start(&self) -> Result<(), AgentError> {
        let out = self
            .exec("xdotool", &["getdisplaygeometry"])
            .await
            .map_err(|e| {
                AgentError::NotReady(format!("display {} unavailable: {e:#}", self.cfg.display))
            })?;
        let geometry = String::from_utf8_lossy(&out.stdout);
        info!(display = %self.cfg.display, geometry = %geometry.trim(), "desktop ready");
        Ok(())
    }

    async fn stop(&self) -> Result<(), AgentError> {
        let mut bg = self.background.lock().await;
        for mut child in bg.drain(..) {
            if let Err(e) = child.kill().await {
                warn!("failed to kill background command: {}", e);
            }
        }
        Ok(())
    }

    async fn screenshot(&self) -> Result<Vec<u8>, AgentError> {
        self.screenshot_png().await.map_err(exec_err)
    }

    async fn click(&self, x: i32, y: i32) -> Result<(), AgentError> {
        self.click_at(x, y).await.map_err(exec_err)
    }

    async fn type_text(&self, text: &str) -> Result<(), AgentError> {
        self.type_str(text).await.map_err(exec_err)
    }

    async fn key(&self, combo: &str) -> Result<(), AgentError> {
        self.press(combo).await.map_err(exec_err)
    }

    async fn run(&self, command: &str, background: bool) -> Result<CommandOutput, AgentError> {
        self.shell(command, background).await.map_err(exec_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_common_combos() {
        assert_eq!(normalize_combo("Ctrl+Alt+T"), "ctrl+alt+T");
        assert_eq!(normalize_combo("enter"), "Return");
        assert_eq!(normalize_combo("cmd + c"), "super+c");
        assert_eq!(normalize_combo("ctrl+shift+Page_Up"), "ctrl+shift+Page_Up");
    }

    #[tokio::test]
    async fn foreground_command_returns_output() {
        let desktop = X11Desktop::new(DesktopConfig::default());
        let out = desktop.shell("echo hi", false).await.unwrap();
        assert_eq!(out.stdout.trim(), "hi");
        assert_eq!(out.exit_code, Some(0));

        let out = desktop.shell("exit 3", false).await.unwrap();
        assert_eq!(out.exit_code, Some(3));
    }

    #[tokio::test]
    async fn background_command_is_acknowledged_and_killed_on_stop() {
        let desktop = X11Desktop::new(DesktopConfig::default());
        let out = desktop.shell("sleep 30", true).await.unwrap();
        assert!(out.stdout.starts_with("pid "));
        assert_eq!(out.exit_code, None);
        desktop.stop().await.unwrap();
        assert!(desktop.background.lock().await.is_empty());
    }
}
