//! `DeviceTransport`: the narrow seam between the Driver Adapter and the ADB
//! command-line wrapper (an external collaborator per spec §1). Tests drive
//! the adapter's handshake and framing logic against an in-process fake
//! rather than a real device.

use async_trait::async_trait;

use crate::error::{AppError, Result};

/// Operations the Driver Adapter needs from ADB during session setup.
/// Intentionally narrow: nothing about pairing, device discovery, or the
/// general `adb` CLI surface leaks through this trait.
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    /// Push the scrcpy server binary to `remote_path` on the target device.
    async fn push(&self, serial: &str, local_jar: &str, remote_path: &str) -> Result<()>;

    /// Install `localabstract:scrcpy_<scid>` -> `host_port` on the device.
    async fn reverse(&self, serial: &str, scid: &str, host_port: u16) -> Result<()>;

    /// Tear down a reverse tunnel previously installed with `reverse`.
    async fn reverse_remove(&self, serial: &str, scid: &str) -> Result<()>;

    /// Launch the scrcpy server via `app_process`, detached, with `args`.
    async fn shell_start_server(&self, serial: &str, remote_path: &str, args: &[String]) -> Result<()>;
}

/// Shells out to the `adb` binary on `$PATH`.
pub struct AdbTransport {
    adb_binary: String,
}

impl AdbTransport {
    pub fn new(adb_binary: impl Into<String>) -> Self {
        Self {
            adb_binary: adb_binary.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<()> {
        let output = tokio::process::Command::new(&self.adb_binary)
            .args(args)
            .output()
            .await
            .map_err(AppError::Io)?;
        if !output.status.success() {
            return Err(AppError::Protocol(format!(
                "adb {:?} exited with {}: {}",
                args,
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }
}

impl Default for AdbTransport {
    fn default() -> Self {
        Self::new("adb")
    }
}

#[async_trait]
impl DeviceTransport for AdbTransport {
    async fn push(&self, serial: &str, local_jar: &str, remote_path: &str) -> Result<()> {
        self.run(&["-s", serial, "push", local_jar, remote_path])
            .await
    }

    async fn reverse(&self, serial: &str, scid: &str, host_port: u16) -> Result<()> {
        let device_side = format!("localabstract:scrcpy_{scid}");
        let host_side = format!("tcp:{host_port}");
        self.run(&["-s", serial, "reverse", &device_side, &host_side])
            .await
    }

    async fn reverse_remove(&self, serial: &str, scid: &str) -> Result<()> {
        let device_side = format!("localabstract:scrcpy_{scid}");
        self.run(&["-s", serial, "reverse", "--remove", &device_side])
            .await
    }

    async fn shell_start_server(&self, serial: &str, remote_path: &str, args: &[String]) -> Result<()> {
        let mut cmd_args: Vec<&str> = vec![
            "-s",
            serial,
            "shell",
            "CLASSPATH",
            remote_path,
            "app_process",
            "/",
            "com.genymobile.scrcpy.Server",
        ];
        let extra: Vec<&str> = args.iter().map(String::as_str).collect();
        cmd_args.extend(extra);
        self.run(&cmd_args).await
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    /// Records every call made against it; never touches a real device.
    #[derive(Default)]
    pub struct FakeTransport {
        pub calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DeviceTransport for FakeTransport {
        async fn push(&self, serial: &str, local_jar: &str, remote_path: &str) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("push {serial} {local_jar} {remote_path}"));
            Ok(())
        }

        async fn reverse(&self, serial: &str, scid: &str, host_port: u16) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("reverse {serial} {scid} {host_port}"));
            Ok(())
        }

        async fn reverse_remove(&self, serial: &str, scid: &str) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("reverse_remove {serial} {scid}"));
            Ok(())
        }

        async fn shell_start_server(
            &self,
            serial: &str,
            remote_path: &str,
            args: &[String],
        ) -> Result<()> {
            self.calls.lock().unwrap().push(format!(
                "shell_start_server {serial} {remote_path} {}",
                args.join(" ")
            ));
            Ok(())
        }
    }

    #[tokio::test]
    async fn fake_records_calls_in_order() {
        let fake = FakeTransport::default();
        fake.push("ABC123", "scrcpy-server.jar", "/data/local/tmp/scrcpy-server.jar")
            .await
            .unwrap();
        fake.reverse("ABC123", "deadbeef", 27183).await.unwrap();
        fake.reverse_remove("ABC123", "deadbeef").await.unwrap();

        let calls = fake.calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        assert!(calls[0].starts_with("push"));
        assert!(calls[1].starts_with("reverse "));
        assert!(calls[2].starts_with("reverse_remove"));
    }
}
