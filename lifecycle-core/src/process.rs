//! OS process sandbox backend
//!
//! Runs one host program per sandbox. On unix the memory limit is applied
//! to the child as an address-space rlimit before it execs, so the kernel
//! refuses allocations past it. CPU and memory are read from the process
//! table through `sysinfo`; a CPU rate has no rlimit equivalent and is only
//! watched. Egress is not observable at this level and always reads zero.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use sysinfo::{Pid, System};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::error::ResourceError;
use crate::sandbox::{BackendResult, IsolationLevel, LimitKind, SandboxBackend, SandboxRequest, UsageSnapshot};

/// Cap the child's address space at `memory_bytes`; zero leaves it unlimited
#[cfg(unix)]
#[allow(unsafe_code)]
fn cap_address_space(command: &mut Command, memory_bytes: u64) {
    if memory_bytes == 0 {
        return;
    }
    let bytes = libc::rlim_t::try_from(memory_bytes).unwrap_or(libc::RLIM_INFINITY);
    let limit = libc::rlimit {
        rlim_cur: bytes,
        rlim_max: bytes,
    };
    // SAFETY: the hook runs between fork and exec and only calls setrlimit,
    // which is async-signal-safe, on a limit value copied into the closure.
    unsafe {
        command.pre_exec(move || {
            if libc::setrlimit(libc::RLIMIT_AS, &limit) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

pub struct ProcessBackend {
    program: PathBuf,
    args: Vec<String>,
    children: DashMap<String, Child>,
    by_key: DashMap<String, String>,
    system: Mutex<System>,
}

impl ProcessBackend {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            children: DashMap::new(),
            by_key: DashMap::new(),
            system: Mutex::new(System::new()),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn running(&self) -> usize {
        self.children.len()
    }

    /// Pid of a live child, dropping children that already exited
    fn live_pid(&self, backend_ref: &str) -> Option<u32> {
        let mut child = self.children.get_mut(backend_ref)?;
        match child.try_wait() {
            Ok(None) => child.id(),
            Ok(Some(status)) => {
                debug!(backend_ref = backend_ref, status = %status, "Sandbox process exited");
                drop(child);
                self.children.remove(backend_ref);
                None
            }
            Err(error) => {
                warn!(backend_ref = backend_ref, error = %error, "Cannot poll sandbox process");
                child.id()
            }
        }
    }
}

#[async_trait]
impl SandboxBackend for ProcessBackend {
    fn level(&self) -> IsolationLevel {
        IsolationLevel::Process
    }

    fn enforced_limits(&self) -> &'static [LimitKind] {
        if cfg!(unix) {
            &[LimitKind::Memory]
        } else {
            &[]
        }
    }

    async fn provision(&self, request: &SandboxRequest) -> BackendResult<String> {
        if let Some(existing) = self.by_key.get(&request.key).map(|entry| entry.value().clone()) {
            if self.live_pid(&existing).is_some() {
                return Ok(existing);
            }
        }

        let capabilities = request
            .capabilities
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env("MODHOST_MODULE_ID", request.module_id.as_str())
            .env("MODHOST_TENANT_ID", request.tenant_id.to_string())
            .env("MODHOST_CAPABILITIES", capabilities)
            .env("MODHOST_MEMORY_LIMIT", request.limits.memory_bytes.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        #[cfg(unix)]
        cap_address_space(&mut command, request.limits.memory_bytes);

        let child = command
            .spawn()
            .map_err(|error| ResourceError::Backend(format!("spawn {}: {error}", self.program.display())))?;

        let pid = child
            .id()
            .ok_or_else(|| ResourceError::Backend("sandbox process exited during spawn".to_string()))?;
        let backend_ref = format!("process-{pid}");

        self.children.insert(backend_ref.clone(), child);
        self.by_key.insert(request.key.clone(), backend_ref.clone());
        debug!(backend_ref = %backend_ref, module = %request.module_id, "Sandbox process started");
        Ok(backend_ref)
    }

    async fn destroy(&self, backend_ref: &str) -> BackendResult<()> {
        self.by_key.retain(|_, value| value != backend_ref);
        let Some((_, mut child)) = self.children.remove(backend_ref) else {
            return Ok(());
        };
        if let Err(error) = child.kill().await {
            // Already reaped children report an error here
            debug!(backend_ref = backend_ref, error = %error, "Kill on sandbox process");
        }
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    async fn sample(&self, backend_ref: &str) -> BackendResult<Option<UsageSnapshot>> {
        let Some(pid) = self.live_pid(backend_ref) else {
            return Ok(None);
        };
        let pid = Pid::from_u32(pid);

        let mut system = self.system.lock();
        if !system.refresh_process(pid) {
            return Ok(None);
        }
        Ok(system.process(pid).map(|process| {
            // sysinfo reports percent of one core
            let cpu_millis = (f64::from(process.cpu_usage()).max(0.0) * 10.0).round() as u64;
            UsageSnapshot::new(cpu_millis, process.memory(), 0)
        }))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::model::ModuleId;
    use crate::sandbox::ResourceLimits;
    use uuid::Uuid;

    fn request(key: &str) -> SandboxRequest {
        SandboxRequest {
            key: key.to_string(),
            installation_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            module_id: ModuleId::from("reports"),
            level: IsolationLevel::Process,
            limits: ResourceLimits::default(),
            capabilities: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_process_lifecycle() {
        let backend = ProcessBackend::new("sleep").with_args(["30"]);

        let backend_ref = backend.provision(&request("op/reports")).await.unwrap();
        let again = backend.provision(&request("op/reports")).await.unwrap();
        assert_eq!(backend_ref, again);
        assert_eq!(backend.running(), 1);

        let usage = backend.sample(&backend_ref).await.unwrap();
        assert!(usage.is_some());

        backend.destroy(&backend_ref).await.unwrap();
        backend.destroy(&backend_ref).await.unwrap();
        assert_eq!(backend.running(), 0);
        assert!(backend.sample(&backend_ref).await.unwrap().is_none());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_memory_limit_is_applied_to_the_child() {
        let backend = ProcessBackend::new("sleep").with_args(["30"]);
        assert_eq!(backend.enforced_limits(), &[LimitKind::Memory]);

        let mut capped = request("op/capped");
        capped.limits.memory_bytes = 512 * 1024 * 1024;
        let backend_ref = backend.provision(&capped).await.unwrap();
        let pid = backend.live_pid(&backend_ref).unwrap();

        let limits = std::fs::read_to_string(format!("/proc/{pid}/limits")).unwrap();
        let address_space = limits
            .lines()
            .find(|line| line.starts_with("Max address space"))
            .unwrap();
        let values: Vec<&str> = address_space.split_whitespace().skip(3).take(2).collect();
        assert_eq!(values, vec!["536870912", "536870912"]);

        backend.destroy(&backend_ref).await.unwrap();
    }

    #[tokio::test]
    async fn test_spawn_failure_is_a_backend_error() {
        let backend = ProcessBackend::new("/nonexistent/modhost-sandbox");
        let error = backend.provision(&request("op/missing")).await.unwrap_err();
        assert!(matches!(error, ResourceError::Backend(_)));
        assert_eq!(backend.running(), 0);
    }
}
