//! Containerised command execution using Linux namespaces.
//!
//! Recipes never run on the host: every stage executes inside an
//! unprivileged container assembled from an image-set layer rootfs plus a
//! list of bind mounts. The harness surfaces only an exit code; stdout and
//! stderr are inherited, or discarded in quiet mode.
//!
//! Isolation used:
//! - user namespace (root inside maps to the invoking user)
//! - mount namespace (bind-mount composition, private propagation)
//! - PID namespace (the stage command is init of its own tree)
//!
//! The network namespace is shared: source fetch stages download inside
//! the container.

use nix::mount::{mount, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{chdir, chroot, fork, ForkResult, Gid, Uid};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("failed to create namespace: {0}")]
    Namespace(nix::Error),

    #[error("failed to bind {0}: {1}")]
    Mount(PathBuf, nix::Error),

    #[error("failed to execute command: {0}")]
    Execution(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("nix error: {0}")]
    Nix(#[from] nix::Error),
}

pub type Result<T> = std::result::Result<T, ContainerError>;

/// One bind mount inside the container.
#[derive(Debug, Clone)]
struct BindMount {
    source: PathBuf,
    /// Absolute path inside the container.
    target: String,
    read_only: bool,
}

/// A configured container invocation. Build one per stage execution.
#[derive(Debug)]
pub struct Container {
    rootfs: PathBuf,
    workdir: String,
    mounts: Vec<BindMount>,
    env: Vec<(String, String)>,
    quiet: bool,
    interactive: bool,
}

impl Container {
    pub fn new(rootfs: impl Into<PathBuf>) -> Self {
        Self {
            rootfs: rootfs.into(),
            workdir: "/".to_string(),
            mounts: Vec::new(),
            env: Vec::new(),
            quiet: false,
            interactive: false,
        }
    }

    /// Working directory inside the container.
    pub fn workdir(mut self, dir: impl Into<String>) -> Self {
        self.workdir = dir.into();
        self
    }

    pub fn mount(mut self, source: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        self.mounts.push(BindMount {
            source: source.into(),
            target: target.into(),
            read_only: false,
        });
        self
    }

    pub fn mount_ro(mut self, source: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        self.mounts.push(BindMount {
            source: source.into(),
            target: target.into(),
            read_only: true,
        });
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Discard child stdout/stderr.
    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    /// Inherit stdin (for `--exec`).
    pub fn interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    /// Run a shell command, returning its exit code.
    pub fn run_shell(&self, script: &str) -> Result<i32> {
        self.execute(&["/bin/sh".to_string(), "-c".to_string(), script.to_string()])
    }

    /// Run an argv vector, returning its exit code.
    pub fn run(&self, argv: &[String]) -> Result<i32> {
        if argv.is_empty() {
            return Err(ContainerError::Execution("empty argv".into()));
        }
        self.execute(argv)
    }

    fn execute(&self, argv: &[String]) -> Result<i32> {
        let uid = Uid::current();
        let gid = Gid::current();

        // Fork so the namespace setup never touches the engine process.
        match unsafe { fork() }? {
            ForkResult::Parent { child } => match waitpid(child, None)? {
                WaitStatus::Exited(_, code) => Ok(code),
                WaitStatus::Signaled(_, signal, _) => Ok(128 + signal as i32),
                status => Err(ContainerError::Execution(format!(
                    "child ended unexpectedly: {status:?}"
                ))),
            },
            ForkResult::Child => {
                let code = match self.child_main(argv, uid, gid) {
                    Ok(code) => code,
                    Err(e) => {
                        eprintln!("chariot: container setup failed: {e}");
                        127
                    }
                };
                std::process::exit(code);
            }
        }
    }

    /// Runs in the forked child: enter namespaces, compose mounts, chroot,
    /// exec. Never returns to the engine.
    fn child_main(&self, argv: &[String], uid: Uid, gid: Gid) -> Result<i32> {
        unshare(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWPID)
            .map_err(ContainerError::Namespace)?;

        // Map root inside the container to the invoking user.
        fs::write("/proc/self/uid_map", format!("0 {uid} 1"))?;
        fs::write("/proc/self/setgroups", "deny")?;
        fs::write("/proc/self/gid_map", format!("0 {gid} 1"))?;

        // Keep our mounts out of the host namespace.
        mount(
            None::<&str>,
            "/",
            None::<&str>,
            MsFlags::MS_PRIVATE | MsFlags::MS_REC,
            None::<&str>,
        )?;

        self.bind(Path::new("/dev"), "/dev", false)?;
        self.bind(Path::new("/proc"), "/proc", false)?;
        for m in &self.mounts {
            self.bind(&m.source, &m.target, m.read_only)?;
        }

        chroot(&self.rootfs)?;
        chdir(Path::new(&self.workdir))?;

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd.env_clear();
        cmd.env(
            "PATH",
            "/usr/local/bin:/usr/local/sbin:/usr/bin:/usr/sbin:/bin:/sbin",
        );
        cmd.env("HOME", "/root");
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        if self.interactive {
            cmd.stdin(Stdio::inherit());
        } else {
            cmd.stdin(Stdio::null());
        }
        if self.quiet {
            cmd.stdout(Stdio::null());
            cmd.stderr(Stdio::null());
        }

        let status = cmd
            .status()
            .map_err(|e| ContainerError::Execution(format!("{}: {e}", argv[0])))?;
        Ok(status.code().unwrap_or(1))
    }

    fn bind(&self, source: &Path, target: &str, read_only: bool) -> Result<()> {
        let inside = self.rootfs.join(target.trim_start_matches('/'));
        fs::create_dir_all(&inside)?;
        mount(
            Some(source),
            &inside,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(|e| ContainerError::Mount(inside.clone(), e))?;

        if read_only {
            mount(
                None::<&str>,
                &inside,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                None::<&str>,
            )
            .map_err(|e| ContainerError::Mount(inside, e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_composes_mounts_and_env() {
        let c = Container::new("/tmp/rootfs")
            .workdir("/chariot/build")
            .mount("/tmp/deps", "/chariot/sources")
            .mount_ro("/tmp/patches", "/chariot/patches")
            .env("OPTION_arch", "x86_64")
            .quiet(true);

        assert_eq!(c.workdir, "/chariot/build");
        assert_eq!(c.mounts.len(), 2);
        assert!(!c.mounts[0].read_only);
        assert!(c.mounts[1].read_only);
        assert_eq!(c.env[0].0, "OPTION_arch");
        assert!(c.quiet);
    }

    #[test]
    fn empty_argv_is_rejected() {
        let c = Container::new("/tmp/rootfs");
        assert!(matches!(c.run(&[]), Err(ContainerError::Execution(_))));
    }
}
