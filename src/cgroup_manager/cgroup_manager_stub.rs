use std::{process::Child, time::Duration};

use anyhow::{self, bail, Context};
use tracing::warn;

use super::create_process;

#[derive(Debug)]
pub struct LimitedProcess {
    pub child: Child,
    cleaned_up: bool,
}

impl LimitedProcess {
    pub fn launch(
        _command: &str,
        _args: &[String],
        _max_memory: i64,
        _cpus: &str,
        _allow_stderr: bool,
    ) -> anyhow::Result<LimitedProcess> {
        bail!("cgroups only available on linux")
    }

    pub fn try_kill(&mut self, _max_duration: Duration) -> anyhow::Result<()> {
        self.child.kill().context("could not kill process")?;
        let _ = self.child.wait();
        self.cleaned_up = true;
        Ok(())
    }

    pub fn launch_without_container(
        command: &str,
        args: &[String],
        allow_stderr: bool,
    ) -> anyhow::Result<LimitedProcess> {
        let child =
            create_process(command, args, allow_stderr).context("could not create process")?;

        Ok(LimitedProcess {
            child,
            cleaned_up: false,
        })
    }
}

impl Drop for LimitedProcess {
    fn drop(&mut self) {
        static CLEANUP_DURATION: Duration = Duration::from_secs(1);
        if !self.cleaned_up {
            if let Err(e) = self.try_kill(CLEANUP_DURATION) {
                warn!("could not kill worker process {}: {e:#}", self.child.id());
            }
        }
    }
}
