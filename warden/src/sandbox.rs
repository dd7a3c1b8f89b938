//! Per-role syscall sandboxing.
//!
//! Each process class gets its own profile, installed as the final step of
//! the privilege drop: network workers keep sockets and sub-process
//! spawning but lose introspection, mount and identity syscalls; the
//! key-manager additionally loses the ability to create sockets (its only
//! channel is the inherited socketpair); the ACME sibling keeps sockets
//! for the provisioning exchange but cannot exec.
//!
//! On Linux/x86_64 the profiles compile to seccomp BPF; elsewhere the
//! install reports not-enforced and the privilege drop alone stands.

use crate::Result;

/// Sandbox profile selector, keyed by process class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Network,
    Keymgr,
    Acme,
}

impl Role {
    pub fn name(self) -> &'static str {
        match self {
            Role::Network => "network",
            Role::Keymgr => "keymgr",
            Role::Acme => "acme",
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(all(target_os = "linux", target_arch = "x86_64"))] {
        mod imp {
            use super::Role;
            use crate::{Error, Result};
            use std::collections::BTreeMap;

            // x86_64 syscall numbers, see asm/unistd_64.h.
            mod nr {
                pub const PTRACE: i64 = 101;
                pub const PROCESS_VM_READV: i64 = 310;
                pub const PROCESS_VM_WRITEV: i64 = 311;

                pub const REBOOT: i64 = 169;
                pub const KEXEC_LOAD: i64 = 246;
                pub const KEXEC_FILE_LOAD: i64 = 320;

                pub const INIT_MODULE: i64 = 175;
                pub const DELETE_MODULE: i64 = 176;
                pub const FINIT_MODULE: i64 = 313;

                pub const PIVOT_ROOT: i64 = 155;
                pub const CHROOT: i64 = 161;
                pub const MOUNT: i64 = 165;
                pub const UMOUNT2: i64 = 166;

                pub const SETUID: i64 = 105;
                pub const SETGID: i64 = 106;
                pub const SETGROUPS: i64 = 116;
                pub const SETREUID: i64 = 113;
                pub const SETREGID: i64 = 114;
                pub const SETRESUID: i64 = 117;
                pub const SETRESGID: i64 = 119;
                pub const SETFSUID: i64 = 122;
                pub const SETFSGID: i64 = 123;

                pub const SOCKET: i64 = 41;
                pub const CONNECT: i64 = 42;
                pub const ACCEPT: i64 = 43;
                pub const BIND: i64 = 49;
                pub const LISTEN: i64 = 50;
                pub const ACCEPT4: i64 = 288;

                pub const FORK: i64 = 57;
                pub const VFORK: i64 = 58;
                pub const EXECVE: i64 = 59;
                pub const EXECVEAT: i64 = 322;
            }

            fn blocked_syscalls(role: Role) -> Vec<i64> {
                // The floor for every process: no debugging of siblings, no
                // kernel or mount tampering, no second chroot, no identity
                // changes after the drop.
                let mut blocked = vec![
                    nr::PTRACE,
                    nr::PROCESS_VM_READV,
                    nr::PROCESS_VM_WRITEV,
                    nr::REBOOT,
                    nr::KEXEC_LOAD,
                    nr::KEXEC_FILE_LOAD,
                    nr::INIT_MODULE,
                    nr::DELETE_MODULE,
                    nr::FINIT_MODULE,
                    nr::PIVOT_ROOT,
                    nr::CHROOT,
                    nr::MOUNT,
                    nr::UMOUNT2,
                    nr::SETUID,
                    nr::SETGID,
                    nr::SETGROUPS,
                    nr::SETREUID,
                    nr::SETREGID,
                    nr::SETRESUID,
                    nr::SETRESGID,
                    nr::SETFSUID,
                    nr::SETFSGID,
                ];

                match role {
                    // Workers accept connections and may run scripted
                    // sub-processes; sockets and fork/exec stay open.
                    Role::Network => {}
                    // The keymgr's only channel is the inherited pair.
                    Role::Keymgr => {
                        blocked.extend([
                            nr::SOCKET,
                            nr::CONNECT,
                            nr::ACCEPT,
                            nr::ACCEPT4,
                            nr::BIND,
                            nr::LISTEN,
                            nr::FORK,
                            nr::VFORK,
                            nr::EXECVE,
                            nr::EXECVEAT,
                        ]);
                    }
                    // The provisioning client dials out, so sockets stay;
                    // nothing in the ACME flow ever execs.
                    Role::Acme => {
                        blocked.extend([
                            nr::ACCEPT,
                            nr::ACCEPT4,
                            nr::BIND,
                            nr::LISTEN,
                            nr::FORK,
                            nr::VFORK,
                            nr::EXECVE,
                            nr::EXECVEAT,
                        ]);
                    }
                }

                blocked
            }

            pub fn install(role: Role) -> Result<bool> {
                use seccompiler::{
                    BpfProgram, SeccompAction, SeccompFilter, SeccompRule, TargetArch,
                };

                unsafe {
                    libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0);
                }

                let rules: BTreeMap<i64, Vec<SeccompRule>> = blocked_syscalls(role)
                    .into_iter()
                    .map(|nr| (nr, vec![]))
                    .collect();

                let filter = SeccompFilter::new(
                    rules,
                    SeccompAction::Allow,
                    SeccompAction::KillProcess,
                    TargetArch::x86_64,
                )
                .map_err(|err| Error::Sandbox(err.to_string()))?;

                let program: BpfProgram = filter
                    .try_into()
                    .map_err(|err: seccompiler::BackendError| Error::Sandbox(err.to_string()))?;

                seccompiler::apply_filter(&program)
                    .map_err(|err| Error::Sandbox(err.to_string()))?;

                Ok(true)
            }

            #[cfg(test)]
            pub fn blocked_for_tests(role: Role) -> Vec<i64> {
                blocked_syscalls(role)
            }
        }

        #[cfg(test)]
        pub use imp::blocked_for_tests;
    } else {
        mod imp {
            use super::Role;
            use crate::Result;

            pub fn install(_role: Role) -> Result<bool> {
                Ok(false)
            }
        }
    }
}

/// Install the sandbox for `role`.
///
/// Returns whether a filter was actually enforced; callers log the
/// outcome but an unenforced platform is not an error.
pub fn install(role: Role) -> Result<bool> {
    imp::install(role)
}
