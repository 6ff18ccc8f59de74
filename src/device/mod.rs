//! C1 Device Port: capture/tap/swipe/key primitives over `adb`, plus
//! reconnect-with-backoff. Mirrors the ADB-wrapping idiom used throughout the
//! rest of this codebase's action/perception layers, but narrows the error
//! surface to `EngineError` so the auto-loop can match on failure kind.

use crate::error::{EngineError, EngineResult};
use opencv::core::Mat;
use opencv::imgcodecs;
use opencv::prelude::*;
use std::process::Command;
use std::time::Duration;
use tracing::{debug, warn};

/// A captured screenshot. Always BGR8, dimensions taken from the decoded Mat.
#[derive(Clone)]
pub struct Frame {
    pub mat: Mat,
}

impl Frame {
    pub fn width(&self) -> i32 {
        self.mat.cols()
    }

    pub fn height(&self) -> i32 {
        self.mat.rows()
    }
}

pub struct DevicePort {
    adb_device: Option<String>,
    capture_timeout_secs: u64,
    op_timeout_secs: u64,
}

impl DevicePort {
    pub fn new(adb_device: Option<String>, capture_timeout_secs: u64, op_timeout_secs: u64) -> Self {
        Self {
            adb_device,
            capture_timeout_secs,
            op_timeout_secs,
        }
    }

    fn adb_args<'a>(&'a self, rest: &'a [&'a str]) -> Vec<&'a str> {
        let mut args = Vec::with_capacity(rest.len() + 2);
        if let Some(dev) = &self.adb_device {
            args.push("-s");
            args.push(dev.as_str());
        }
        args.extend_from_slice(rest);
        args
    }

    fn adb(&self, args: &[&str]) -> EngineResult<String> {
        let full_args = self.adb_args(args);
        let out = Command::new("adb")
            .args(&full_args)
            .output()
            .map_err(|e| EngineError::Transport(format!("spawn adb: {e}")))?;
        let stdout = String::from_utf8_lossy(&out.stdout).to_string();
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr).to_string();
            if stdout.trim().is_empty() {
                return Err(EngineError::Transport(format!(
                    "adb {:?} failed: {stderr}",
                    args
                )));
            }
            warn!("adb {:?} exited non-zero but produced output: {stderr}", args);
        }
        Ok(stdout)
    }

    fn adb_bytes(&self, args: &[&str]) -> EngineResult<Vec<u8>> {
        let full_args = self.adb_args(args);
        let out = Command::new("adb")
            .args(&full_args)
            .output()
            .map_err(|e| EngineError::Transport(format!("spawn adb: {e}")))?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr).to_string();
            return Err(EngineError::Transport(format!(
                "adb {:?} failed: {stderr}",
                args
            )));
        }
        Ok(out.stdout)
    }

    /// Capture a frame. Fails with `Disconnected`/`Decode` rather than panicking.
    pub fn capture(&self) -> EngineResult<Frame> {
        let bytes = self.adb_bytes(&["exec-out", "screencap", "-p"])?;
        if bytes.len() < 100 {
            return Err(EngineError::Disconnected);
        }
        let buf = Mat::from_slice(&bytes).map_err(|e| EngineError::Decode(e.to_string()))?;
        let mat = imgcodecs::imdecode(&buf, imgcodecs::IMREAD_COLOR)
            .map_err(|e| EngineError::Decode(e.to_string()))?;
        if mat.empty() {
            return Err(EngineError::Decode("empty decoded frame".into()));
        }
        Ok(Frame { mat })
    }

    pub fn tap(&self, x: i32, y: i32) -> EngineResult<()> {
        self.adb(&["shell", "input", "tap", &x.to_string(), &y.to_string()])?;
        Ok(())
    }

    pub fn swipe(&self, x1: i32, y1: i32, x2: i32, y2: i32, duration_ms: u64) -> EngineResult<()> {
        let duration_ms = duration_ms.max(1);
        self.adb(&[
            "shell",
            "input",
            "swipe",
            &x1.to_string(),
            &y1.to_string(),
            &x2.to_string(),
            &y2.to_string(),
            &duration_ms.to_string(),
        ])?;
        Ok(())
    }

    pub fn key(&self, keycode: &str) -> EngineResult<()> {
        self.adb(&["shell", "input", "keyevent", keycode])?;
        Ok(())
    }

    pub fn is_alive(&self) -> bool {
        self.adb(&["get-state"])
            .map(|s| s.trim() == "device")
            .unwrap_or(false)
    }

    /// Exponential backoff reconnect: delays `base * 2^n` for n = 0..tries-1,
    /// regardless of outcome (spec §8 P11) — only the final try's result
    /// decides the return value.
    pub fn reconnect(&self, max_tries: u32, base_delay: Duration) -> bool {
        for n in 0..max_tries {
            if self.is_alive() {
                return true;
            }
            let delay = base_delay * 2u32.pow(n);
            debug!("reconnect attempt {n} failed, sleeping {delay:?}");
            std::thread::sleep(delay);
        }
        self.is_alive()
    }

    pub fn force_stop(&self, package: &str) -> EngineResult<()> {
        self.adb(&["shell", "am", "force-stop", package])?;
        Ok(())
    }

    pub fn launch_app(&self, package: &str) -> EngineResult<()> {
        self.adb(&[
            "shell",
            "monkey",
            "-p",
            package,
            "-c",
            "android.intent.category.LAUNCHER",
            "1",
        ])?;
        Ok(())
    }

    pub fn type_text(&self, text: &str) -> EngineResult<()> {
        let escaped = text.replace(' ', "%s");
        self.adb(&["shell", "input", "text", &escaped])?;
        Ok(())
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.op_timeout_secs)
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_secs(self.capture_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adb_args_prefixes_device_serial() {
        let port = DevicePort::new(Some("emulator-5554".to_string()), 15, 10);
        let args = port.adb_args(&["shell", "input", "tap", "1", "2"]);
        assert_eq!(args, vec!["-s", "emulator-5554", "shell", "input", "tap", "1", "2"]);
    }

    #[test]
    fn adb_args_without_device_has_no_prefix() {
        let port = DevicePort::new(None, 15, 10);
        let args = port.adb_args(&["get-state"]);
        assert_eq!(args, vec!["get-state"]);
    }
}
