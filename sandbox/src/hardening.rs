//! In-process restrictions the child applies to itself before loading user
//! code: rlimits, uid drop, `no_new_privs`, Landlock filesystem rules, and
//! a seccomp filter denying network syscalls.
//!
//! Everything here runs on the child's main thread so the restrictions
//! cover the whole process for its remaining lifetime.

use std::collections::BTreeMap;
use std::path::Path;

use landlock::ABI;
#[allow(unused_imports)]
use landlock::Access;
use landlock::AccessFs;
use landlock::CompatLevel;
use landlock::Compatible;
use landlock::Ruleset;
use landlock::RulesetAttr;
use landlock::RulesetCreatedAttr;
use opthub_protocol::SandboxLimits;
use seccompiler::BpfProgram;
use seccompiler::SeccompAction;
use seccompiler::SeccompFilter;
use seccompiler::SeccompRule;
use seccompiler::TargetArch;
use seccompiler::apply_filter;
use thiserror::Error;

#[derive(Debug, Error)]
pub(crate) enum HardeningError {
    #[error("setrlimit({resource}) failed: {source}")]
    Rlimit {
        resource: &'static str,
        source: std::io::Error,
    },
    #[error("failed to drop privileges to uid {uid}: {source}")]
    DropPrivileges { uid: u32, source: std::io::Error },
    #[error("prctl(PR_SET_NO_NEW_PRIVS) failed: {0}")]
    NoNewPrivs(std::io::Error),
    #[error("landlock setup failed: {0}")]
    Landlock(#[from] landlock::RulesetError),
    #[error("landlock rules were not enforced by this kernel")]
    LandlockNotEnforced,
    #[error("seccomp filter construction failed: {0}")]
    SeccompFilter(#[from] seccompiler::BackendError),
    #[error("seccomp filter installation failed: {0}")]
    SeccompInstall(#[from] seccompiler::Error),
}

/// Apply every restriction in dependency order. Rlimits and the uid drop
/// must precede `no_new_privs`; seccomp requires `no_new_privs`.
pub(crate) fn apply(limits: &SandboxLimits, scratch: &Path) -> Result<(), HardeningError> {
    set_rlimit("RLIMIT_AS", libc::RLIMIT_AS, limits.memory_bytes)?;
    set_rlimit("RLIMIT_CPU", libc::RLIMIT_CPU, limits.cpu_secs)?;
    set_rlimit("RLIMIT_FSIZE", libc::RLIMIT_FSIZE, limits.scratch_bytes)?;
    set_rlimit("RLIMIT_NOFILE", libc::RLIMIT_NOFILE, 64)?;
    set_rlimit("RLIMIT_CORE", libc::RLIMIT_CORE, 0)?;

    if let Some(uid) = limits.uid {
        drop_privileges(uid)?;
    }

    set_no_new_privs()?;
    install_filesystem_landlock_rules(scratch)?;
    install_network_seccomp_filter()?;
    Ok(())
}

fn set_rlimit(
    name: &'static str,
    resource: libc::__rlimit_resource_t,
    value: u64,
) -> Result<(), HardeningError> {
    let limit = libc::rlimit {
        rlim_cur: value,
        rlim_max: value,
    };
    let result = unsafe { libc::setrlimit(resource, &limit) };
    if result != 0 {
        return Err(HardeningError::Rlimit {
            resource: name,
            source: std::io::Error::last_os_error(),
        });
    }
    Ok(())
}

/// When launched as root, shed the privileged identity entirely: clear
/// supplementary groups, then set gid and uid. Order matters; setuid last.
fn drop_privileges(uid: u32) -> Result<(), HardeningError> {
    let euid = unsafe { libc::geteuid() };
    if euid != 0 {
        return Ok(());
    }
    let failed = unsafe {
        libc::setgroups(0, std::ptr::null()) != 0
            || libc::setgid(uid) != 0
            || libc::setuid(uid) != 0
    };
    if failed {
        return Err(HardeningError::DropPrivileges {
            uid,
            source: std::io::Error::last_os_error(),
        });
    }
    Ok(())
}

/// `PR_SET_NO_NEW_PRIVS` is required for seccomp and also prevents setuid
/// privilege elevation.
fn set_no_new_privs() -> Result<(), HardeningError> {
    let result = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if result != 0 {
        return Err(HardeningError::NoNewPrivs(std::io::Error::last_os_error()));
    }
    Ok(())
}

/// Read access to the entire filesystem, write access only to the scratch
/// directory and `/dev/null`.
fn install_filesystem_landlock_rules(scratch: &Path) -> Result<(), HardeningError> {
    let abi = ABI::V5;
    let access_rw = AccessFs::from_all(abi);
    let access_ro = AccessFs::from_read(abi);

    let status = Ruleset::default()
        .set_compatibility(CompatLevel::BestEffort)
        .handle_access(access_rw)?
        .create()?
        .add_rules(landlock::path_beneath_rules(&["/"], access_ro))?
        .add_rules(landlock::path_beneath_rules(&["/dev/null"], access_rw))?
        .add_rules(landlock::path_beneath_rules(&[scratch], access_rw))?
        .set_no_new_privs(true)
        .restrict_self()?;

    if status.ruleset == landlock::RulesetStatus::NotEnforced {
        return Err(HardeningError::LandlockNotEnforced);
    }
    Ok(())
}

/// Seccomp filter denying every network-facing syscall plus ptrace and
/// io_uring. The child computes over stdin/stdout pipes it already holds;
/// it has no legitimate use for sockets of any family.
fn install_network_seccomp_filter() -> Result<(), HardeningError> {
    fn deny_syscall(rules: &mut BTreeMap<i64, Vec<SeccompRule>>, nr: i64) {
        rules.insert(nr, vec![]); // empty rule vec = unconditional match
    }

    let mut rules: BTreeMap<i64, Vec<SeccompRule>> = BTreeMap::new();

    deny_syscall(&mut rules, libc::SYS_ptrace);
    deny_syscall(&mut rules, libc::SYS_io_uring_setup);
    deny_syscall(&mut rules, libc::SYS_io_uring_enter);
    deny_syscall(&mut rules, libc::SYS_io_uring_register);

    deny_syscall(&mut rules, libc::SYS_socket);
    deny_syscall(&mut rules, libc::SYS_socketpair);
    deny_syscall(&mut rules, libc::SYS_connect);
    deny_syscall(&mut rules, libc::SYS_accept);
    deny_syscall(&mut rules, libc::SYS_accept4);
    deny_syscall(&mut rules, libc::SYS_bind);
    deny_syscall(&mut rules, libc::SYS_listen);
    deny_syscall(&mut rules, libc::SYS_getpeername);
    deny_syscall(&mut rules, libc::SYS_getsockname);
    deny_syscall(&mut rules, libc::SYS_shutdown);
    deny_syscall(&mut rules, libc::SYS_sendto);
    deny_syscall(&mut rules, libc::SYS_sendmmsg);
    deny_syscall(&mut rules, libc::SYS_recvfrom);
    deny_syscall(&mut rules, libc::SYS_recvmmsg);
    deny_syscall(&mut rules, libc::SYS_getsockopt);
    deny_syscall(&mut rules, libc::SYS_setsockopt);

    let filter = SeccompFilter::new(
        rules,
        SeccompAction::Allow,                     // default – allow
        SeccompAction::Errno(libc::EPERM as u32), // when rule matches – return EPERM
        if cfg!(target_arch = "x86_64") {
            TargetArch::x86_64
        } else if cfg!(target_arch = "aarch64") {
            TargetArch::aarch64
        } else {
            unimplemented!("unsupported architecture for seccomp filter");
        },
    )?;

    let prog: BpfProgram = filter.try_into()?;
    apply_filter(&prog)?;
    Ok(())
}
