//! Docker runtime driven through the `docker` command line client

use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::{
    ContainerRef, ContainerRuntime, ContainerSpec, ContainerState, RuntimeError, RuntimeResult,
};

/// Interval between child exit polls while waiting for a deadline
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Output of a finished `docker` invocation
struct CommandOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

/// [`ContainerRuntime`] backed by the docker CLI
pub struct DockerCli {
    binary: PathBuf,
}

impl DockerCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Run one docker command, killing it once the deadline passes
    fn run(
        &self,
        operation: &'static str,
        args: &[String],
        deadline: Instant,
    ) -> RuntimeResult<CommandOutput> {
        let started = Instant::now();
        if started >= deadline {
            return Err(RuntimeError::Timeout {
                operation,
                elapsed: Duration::ZERO,
            });
        }

        debug!("{} {}", self.binary.display(), args.join(" "));
        let mut child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                RuntimeError::Unavailable(format!(
                    "cannot execute {}: {}",
                    self.binary.display(),
                    e
                ))
            })?;

        // Drain both pipes on their own threads so a chatty child never blocks
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= deadline => {
                    kill(&mut child);
                    return Err(RuntimeError::Timeout {
                        operation,
                        elapsed: started.elapsed(),
                    });
                }
                Ok(None) => std::thread::sleep(POLL_INTERVAL),
                Err(e) => {
                    kill(&mut child);
                    return Err(RuntimeError::Failed {
                        operation,
                        reason: e.to_string(),
                    });
                }
            }
        };

        Ok(CommandOutput {
            success: status.success(),
            stdout: join(stdout),
            stderr: join(stderr),
        })
    }

    /// Run a command that targets an existing container
    fn run_on(
        &self,
        operation: &'static str,
        args: Vec<String>,
        container: &ContainerRef,
        deadline: Instant,
    ) -> RuntimeResult<String> {
        let output = self.run(operation, &args, deadline)?;
        if output.success {
            Ok(output.stdout)
        } else {
            Err(classify_failure(operation, container.as_str(), &output.stderr))
        }
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl ContainerRuntime for DockerCli {
    fn create_container(
        &self,
        spec: &ContainerSpec,
        deadline: Instant,
    ) -> RuntimeResult<ContainerRef> {
        let output = self.run("create", &create_args(spec), deadline)?;
        if !output.success {
            return Err(classify_failure("create", &spec.name, &output.stderr));
        }
        info!(
            "Created container {} ({})",
            spec.name,
            output.stdout.trim()
        );
        Ok(ContainerRef::new(spec.name.clone()))
    }

    fn start(&self, container: &ContainerRef, deadline: Instant) -> RuntimeResult<()> {
        let args = vec!["start".to_string(), container.to_string()];
        self.run_on("start", args, container, deadline)?;
        Ok(())
    }

    fn stop(&self, container: &ContainerRef, deadline: Instant) -> RuntimeResult<()> {
        // Leave docker a little headroom under our own deadline to escalate to SIGKILL
        let grace = deadline
            .saturating_duration_since(Instant::now())
            .saturating_sub(Duration::from_secs(2))
            .as_secs()
            .max(1);
        let args = vec![
            "stop".to_string(),
            "--time".to_string(),
            grace.to_string(),
            container.to_string(),
        ];
        self.run_on("stop", args, container, deadline)?;
        Ok(())
    }

    fn remove(&self, container: &ContainerRef, deadline: Instant) -> RuntimeResult<()> {
        let args = vec![
            "rm".to_string(),
            "--force".to_string(),
            "--volumes".to_string(),
            container.to_string(),
        ];
        self.run_on("remove", args, container, deadline)?;
        Ok(())
    }

    fn inspect(&self, container: &ContainerRef, deadline: Instant) -> RuntimeResult<ContainerState> {
        let args = vec![
            "inspect".to_string(),
            "--type".to_string(),
            "container".to_string(),
            "--format".to_string(),
            "{{.State.Running}}".to_string(),
            container.to_string(),
        ];
        let stdout = self.run_on("inspect", args, container, deadline)?;
        match stdout.trim() {
            "true" => Ok(ContainerState { running: true }),
            "false" => Ok(ContainerState { running: false }),
            other => Err(RuntimeError::Failed {
                operation: "inspect",
                reason: format!("unexpected state output '{}'", other),
            }),
        }
    }
}

/// Build the `docker create` argument list for a container spec
pub(crate) fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec![
        "create".to_string(),
        "--name".to_string(),
        spec.name.clone(),
        "--restart".to_string(),
        "unless-stopped".to_string(),
    ];

    for port in &spec.ports {
        args.push("--publish".to_string());
        args.push(format!(
            "127.0.0.1:{}:{}/tcp",
            port.host_port, port.container_port
        ));
    }

    for mount in &spec.mounts {
        let mut volume = format!("{}:{}", mount.host_path.display(), mount.container_path);
        if mount.read_only {
            volume.push_str(":ro");
        }
        args.push("--volume".to_string());
        args.push(volume);
    }

    for (key, value) in &spec.environment {
        args.push("--env".to_string());
        args.push(format!("{}={}", key, value));
    }

    args.push(spec.image.clone());
    args
}

/// Map docker's stderr onto a typed error
fn classify_failure(operation: &'static str, container: &str, stderr: &str) -> RuntimeError {
    let message = stderr.trim();
    let lower = message.to_lowercase();
    if lower.contains("no such container") || lower.contains("no such object") {
        RuntimeError::NotFound(container.to_string())
    } else if lower.contains("cannot connect to the docker daemon")
        || lower.contains("is the docker daemon running")
        || lower.contains("permission denied while trying to connect")
    {
        RuntimeError::Unavailable(message.to_string())
    } else {
        RuntimeError::Failed {
            operation,
            reason: message.to_string(),
        }
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<String>> {
    pipe.map(|mut pipe| {
        std::thread::spawn(move || {
            let mut buf = String::new();
            if let Err(e) = pipe.read_to_string(&mut buf) {
                warn!("Failed to read docker output: {}", e);
            }
            buf
        })
    })
}

fn join(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

fn kill(child: &mut Child) {
    if let Err(e) = child.kill() {
        warn!("Failed to kill docker process: {}", e);
    }
    let _ = child.wait();
}
