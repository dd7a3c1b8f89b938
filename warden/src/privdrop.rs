//! Privilege partitioning for freshly forked processes.
//!
//! The order here is load-bearing: the user lookup needs the password
//! database and must run before chroot; the descriptor scan must run
//! before the NOFILE limit is tightened so inherited descriptors survive;
//! identity is dropped before the sandbox seals the identity syscalls.

use crate::{
    config::Config,
    sandbox::{self, Role},
    Error, Result,
};
use nix::{
    fcntl::{fcntl, FcntlArg},
    unistd::{self, chdir, chroot, User},
};
use std::{io, os::unix::io::RawFd, path::PathBuf};
use warden_log::{debug, error, warn};

/// Drop privileges for `role`, then seal the process with its sandbox.
///
/// The keymgr and ACME siblings use the keymgr's root/runas overrides when
/// present and fall back to the worker settings otherwise.
pub fn apply(config: &Config, role: Role) -> Result<()> {
    let (runas, root) = paths_for(config, role);

    let root: PathBuf = root.ok_or_else(|| Error::Config("no root directory".to_string()))?;

    // Must happen before chroot.
    let user = if config.skip_runas {
        None
    } else {
        let name = runas.ok_or_else(|| {
            Error::Config("no runas user given and skip_runas not set".to_string())
        })?;
        Some(
            User::from_name(&name)
                .map_err(Error::from)?
                .ok_or(Error::UserNotFound(name))?,
        )
    };

    if config.skip_chroot {
        chdir(&root).map_err(|err| Error::Privdrop("chdir", Box::new(err)))?;
    } else {
        chroot(&root).map_err(|err| Error::Privdrop("chroot", Box::new(err)))?;
        chdir("/").map_err(|err| Error::Privdrop("chdir", Box::new(err)))?;
    }

    raise_nofile_limit(config.worker_rlimit_nofiles);

    if let Some(user) = user {
        #[cfg(not(any(target_os = "ios", target_os = "macos", target_os = "redox")))]
        unistd::setgroups(&[user.gid])
            .map_err(|err| Error::Privdrop("setgroups", Box::new(err)))?;

        cfg_if::cfg_if! {
            if #[cfg(any(target_os = "android", target_os = "freebsd",
                         target_os = "linux", target_os = "openbsd"))] {
                unistd::setresgid(user.gid, user.gid, user.gid)
                    .map_err(|err| Error::Privdrop("setresgid", Box::new(err)))?;
                unistd::setresuid(user.uid, user.uid, user.uid)
                    .map_err(|err| Error::Privdrop("setresuid", Box::new(err)))?;
            } else {
                unistd::setegid(user.gid)
                    .map_err(|err| Error::Privdrop("setegid", Box::new(err)))?;
                unistd::setgid(user.gid)
                    .map_err(|err| Error::Privdrop("setgid", Box::new(err)))?;
                #[cfg(not(any(target_os = "ios", target_os = "macos")))]
                unistd::seteuid(user.uid)
                    .map_err(|err| Error::Privdrop("seteuid", Box::new(err)))?;
                unistd::setuid(user.uid)
                    .map_err(|err| Error::Privdrop("setuid", Box::new(err)))?;
            }
        }
    }

    match sandbox::install(role)? {
        true => debug!("sandbox sealed, profile: {}", role.name()),
        false => debug!("sandbox not enforced on this platform"),
    }

    Ok(())
}

fn paths_for(config: &Config, role: Role) -> (Option<String>, Option<PathBuf>) {
    match role {
        Role::Network => (config.runas_user.clone(), config.root_path.clone()),
        Role::Keymgr | Role::Acme => {
            let keymgr = config.keymgr.as_ref();
            (
                keymgr
                    .and_then(|k| k.runas_user.clone())
                    .or_else(|| config.runas_user.clone()),
                keymgr
                    .and_then(|k| k.root_path.clone())
                    .or_else(|| config.root_path.clone()),
            )
        }
    }
}

/// Raise the NOFILE limit to the configured base plus one slot for every
/// descriptor already open, so inherited listeners and the control pair
/// survive the tightening.  A refusing kernel is logged, not fatal.
fn raise_nofile_limit(base: u64) {
    let mut nofiles = base;

    let mut rl = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rl) } == -1 {
        warn!(
            "getrlimit(RLIMIT_NOFILE): {}",
            io::Error::last_os_error()
        );
    } else {
        let scan = rl.rlim_cur.min(65_536);
        for fd in 0..scan {
            if fcntl(fd as RawFd, FcntlArg::F_GETFD).is_ok() {
                nofiles += 1;
            }
        }
    }

    let rl = libc::rlimit {
        rlim_cur: nofiles as libc::rlim_t,
        rlim_max: nofiles as libc::rlim_t,
    };
    if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &rl) } == -1 {
        error!(
            "setrlimit(RLIMIT_NOFILE, {}): {}",
            nofiles,
            io::Error::last_os_error()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KeymgrConfig;

    #[test]
    fn test_keymgr_paths_fall_back() {
        let config = Config {
            runas_user: Some("_warden".to_string()),
            root_path: Some("/var/warden".into()),
            keymgr: Some(KeymgrConfig {
                root_path: Some("/var/warden/keymgr".into()),
                ..KeymgrConfig::default()
            }),
            ..Config::default()
        };

        let (runas, root) = paths_for(&config, Role::Keymgr);
        assert_eq!(runas.as_deref(), Some("_warden"));
        assert_eq!(root, Some("/var/warden/keymgr".into()));

        let (runas, root) = paths_for(&config, Role::Network);
        assert_eq!(runas.as_deref(), Some("_warden"));
        assert_eq!(root, Some("/var/warden".into()));
    }
}
