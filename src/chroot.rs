//! Process isolation primitive (spec §4.10's `chroot(user, {path})`): drops
//! to an unprivileged uid/gid and confines the process root, used once by
//! the supervisor before it forks pre-auth and per-VC workers.

use anyhow::Context;

/// Looks up `user` in the system user database, `chroot`s to `path`, then
/// permanently drops to that user's uid/gid. Must be called while still
/// running as root; irreversible for the rest of the process's life.
///
/// Order matters: the `chroot` happens before the uid drop so that a
/// privilege-dropped process never has a chance to touch paths outside
/// `path` even transiently.
#[cfg(unix)]
pub fn chroot(user: &str, path: &std::path::Path) -> anyhow::Result<()> {
    let passwd = lookup_user(user)?;

    rustix::process::chdir(path).context("chdir into chroot target")?;
    rustix::process::chroot(path).context("chroot")?;
    rustix::process::chdir("/").context("chdir after chroot")?;

    rustix::process::setgid(passwd.gid).context("setgid")?;
    rustix::process::setuid(passwd.uid).context("setuid")?;

    anyhow::ensure!(
        rustix::process::getuid() == passwd.uid,
        "privilege drop did not take effect"
    );
    Ok(())
}

#[cfg(not(unix))]
pub fn chroot(_user: &str, _path: &std::path::Path) -> anyhow::Result<()> {
    anyhow::bail!("chroot/privilege-drop is only supported on unix targets")
}

struct Passwd {
    uid: rustix::process::Uid,
    gid: rustix::process::Gid,
}

#[cfg(unix)]
fn lookup_user(user: &str) -> anyhow::Result<Passwd> {
    // SAFETY: getpwnam_r-backed lookup via the system's nss config; `user`
    // is a borrowed, NUL-free Rust string converted to a C string for the
    // duration of the call only.
    let cstr = std::ffi::CString::new(user).context("user name contains a NUL byte")?;
    let raw = unsafe { libc::getpwnam(cstr.as_ptr()) };
    anyhow::ensure!(!raw.is_null(), "no such user: {user}");
    let entry = unsafe { &*raw };
    Ok(Passwd {
        uid: rustix::process::Uid::from_raw(entry.pw_uid),
        gid: rustix::process::Gid::from_raw(entry.pw_gid),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_user_is_rejected() {
        let err = lookup_user("no-such-user-versync-test").unwrap_err();
        assert!(err.to_string().contains("no such user"));
    }
}
