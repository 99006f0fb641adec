use std::{
    process::Child,
    sync::atomic::{AtomicU32, Ordering},
    time::{Duration, Instant},
};

use anyhow::{self, Context};
use cgroups_rs::Cgroup;
use tracing::warn;

use super::create_process;

fn get_current_user_id() -> anyhow::Result<String> {
    let output = std::process::Command::new("id")
        .arg("-u")
        .output()
        .context("Could not launch 'id -u'")?;
    let stdout = output.stdout;
    let untrimed_id = std::str::from_utf8(&stdout).context("id is not a valid string")?;
    Ok(untrimed_id.trim().to_string())
}

fn get_cgroup_path(user_id: &str, group_name: &str) -> String {
    format!("user.slice/user-{user_id}.slice/user@{user_id}.service/{group_name}")
}

/// Create a cgroup at `path`.
///
/// * `max_memory` - Maximum available memory in Bytes. Non-positive means no restriction.
/// * `max_pids` - Maximum number of PIDS inside the cgroup at any time. Non-positive means no restriction.
/// * `cpus` - which cpus the members can run one. Uses comma separated cpu ranges ("1-5,7", "1,3,4", ...). Empty string means no restriction.
fn create_cgroup(
    path: &str,
    max_memory: i64,
    max_pids: i64,
    cpus: &str,
) -> anyhow::Result<Cgroup> {
    let mut builder = cgroups_rs::cgroup_builder::CgroupBuilder::new(path);
    if max_memory > 0 {
        builder = builder.memory().memory_hard_limit(max_memory).done();
    }
    if max_pids > 0 {
        builder = builder
            .pid()
            .maximum_number_of_processes(cgroups_rs::MaxValue::Value(max_pids))
            .done();
    }
    if !cpus.is_empty() {
        builder = builder.cpu().cpus(cpus.to_string()).done();
    }
    builder
        .build(cgroups_rs::hierarchies::auto())
        .context("could not create cgroup")
}

fn wait_for_process_cleanup(cgroup: &Cgroup, pid: u64, max_duration: Duration) -> anyhow::Result<()> {
    let deadline = Instant::now() + max_duration;
    while cgroup.tasks().iter().any(|cpid| cpid.pid == pid) {
        if Instant::now() > deadline {
            anyhow::bail!("process {pid} still alive after {max_duration:?}");
        }
        std::thread::sleep(std::cmp::min(Duration::from_millis(10), max_duration / 10));
    }
    Ok(())
}

fn create_process_in_cgroup(
    command: &str,
    args: &[String],
    group: &Cgroup,
    allow_stderr: bool,
) -> anyhow::Result<Child> {
    let mut child = create_process(command, args, allow_stderr)?;

    let pid = child.id() as u64;
    let addition = group.add_task_by_tgid(cgroups_rs::CgroupPid { pid });
    if addition.is_err() {
        let kill = child.kill();

        addition.with_context(|| {
            if let Err(err) = kill {
                format!(
                    "could not add process to cgroup, and process could not be killed either ({err})"
                )
            } else {
                "could not add process to cgroup".to_string()
            }
        })?;
    }
    Ok(child)
}

/// A worker process, optionally confined to its own cgroup. Killed on drop.
#[derive(Debug)]
pub struct LimitedProcess {
    pub child: Child,
    cgroup: Option<Cgroup>,
    cleaned_up: bool,
}

impl LimitedProcess {
    /// Launches `command` inside a fresh cgroup limited to `max_memory` bytes and `cpus`.
    pub fn launch(
        command: &str,
        args: &[String],
        max_memory: i64,
        cpus: &str,
        allow_stderr: bool,
    ) -> anyhow::Result<LimitedProcess> {
        static COUNTER: AtomicU32 = AtomicU32::new(1);
        let user_id = get_current_user_id().context("could not get user id")?;
        let group_name = format!(
            "BATTLE_WORKER_{}_{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let path = get_cgroup_path(&user_id, &group_name);
        // engines are JVMs or similar: leave room for their threads
        let group =
            create_cgroup(&path, max_memory, 512, cpus).context("could not create cgroup")?;
        let child =
            create_process_in_cgroup(command, args, &group, allow_stderr).with_context(|| {
                let _ = group.delete();
                "could not create process in cgroup"
            })?;

        Ok(LimitedProcess {
            child,
            cgroup: Some(group),
            cleaned_up: false,
        })
    }

    pub fn try_kill(&mut self, max_duration: Duration) -> anyhow::Result<()> {
        match &mut self.cgroup {
            Some(cgroup) => {
                cgroup.kill().context("could not kill process")?;
                wait_for_process_cleanup(cgroup, self.child.id() as u64, max_duration)
                    .context("process cleanup timed out")?;
                let _ = self.child.wait();
                self.cleaned_up = true;
                if let Err(e) = cgroup.delete() {
                    warn!("Failed to remove cgroup. If this happens a lot, it may slow down the computer. {e}");
                }
                Ok(())
            }
            None => {
                self.child.kill().context("could not kill process")?;
                let _ = self.child.wait();
                self.cleaned_up = true;
                Ok(())
            }
        }
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
            cgroup: None,
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
