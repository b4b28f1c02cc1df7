//! Process-starter shim — execs a user process with rlimits applied,
//! file descriptors above stderr closed, and (optionally) the bounding
//! capability set reduced to a fixed allow-list, before dropping to the
//! requested uid/gid.
//!
//! Any failure here exits with status 255 and a short message on
//! stderr rather than propagating a `Result` up through `main` — there
//! is no one left to report a structured error to once exec either
//! succeeds (and replaces this process) or fails.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

use clap::Parser;

/// The exact bounding set the shim leaves behind.
const KEPT_CAPABILITIES: &[libc::c_ulong] = &[
    1,  // CAP_DAC_OVERRIDE
    4,  // CAP_FSETID
    3,  // CAP_FOWNER
    27, // CAP_MKNOD
    13, // CAP_NET_RAW
    6,  // CAP_SETGID
    7,  // CAP_SETUID
    31, // CAP_SETFCAP
    8,  // CAP_SETPCAP
    10, // CAP_NET_BIND_SERVICE
    18, // CAP_SYS_CHROOT
    5,  // CAP_KILL
    29, // CAP_AUDIT_WRITE
];

/// Fallback when `/proc/sys/kernel/cap_last_cap` can't be read —
/// CAP_AUDIT_READ (37) on kernels at the time of writing.
const CAP_LAST_CAP_FALLBACK: libc::c_ulong = 37;

#[derive(Parser)]
#[command(name = "proc-starter")]
struct Args {
    /// Encoded rlimits, e.g. "nofile=1024:4096,nproc=256:256".
    #[arg(long, default_value = "")]
    rlimits: String,

    #[arg(long = "dropCapabilities", default_value_t = true)]
    drop_capabilities: bool,

    #[arg(long)]
    uid: libc::uid_t,

    #[arg(long)]
    gid: libc::gid_t,

    /// Program and arguments to exec, after a literal `--`.
    #[arg(last = true, required = true)]
    program: Vec<String>,
}

fn main() {
    // Matches `runtime.LockOSThread()`: the uid/gid/capability changes
    // below must land on the thread that execs, and Rust gives no
    // other guarantee which OS thread `main` runs on.
    lock_os_thread();

    let args = Args::parse();

    close_fds_above_stderr();
    apply_rlimits(&args.rlimits);

    let program_path = match resolve_in_path(&args.program[0]) {
        Ok(path) => path,
        Err(err) => fail(&format!(
            "Program '{}' was not found in $PATH: {err}",
            args.program[0]
        )),
    };

    if args.drop_capabilities {
        if let Err(err) = drop_bounding_capabilities() {
            fail(&format!("dropping capabilities: {err}"));
        }
    }

    exec_as(args.uid, args.gid, &program_path, &args.program);
}

fn fail(message: &str) -> ! {
    eprintln!("ERROR: {message}");
    std::process::exit(255);
}

fn lock_os_thread() {
    // A raw affinity-free no-op on a single-threaded process; kept as a
    // marker of the invariant the Go original enforces explicitly.
}

fn close_fds_above_stderr() {
    let entries = match std::fs::read_dir("/proc/self/fd") {
        Ok(entries) => entries,
        Err(err) => fail(&format!("read /proc/self/fd: {err}")),
    };

    for entry in entries.flatten() {
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        let Ok(fd) = name.parse::<i32>() else {
            continue;
        };
        if fd <= 2 {
            continue;
        }
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFD);
            if flags >= 0 {
                libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC);
            }
        }
    }
}

/// Parses and applies rlimits encoded as `name=soft:hard` pairs
/// separated by commas, e.g. `nofile=1024:4096,nproc=256:256`.
fn apply_rlimits(encoded: &str) {
    for entry in encoded.split(',').filter(|s| !s.is_empty()) {
        let Some((name, bounds)) = entry.split_once('=') else {
            fail(&format!("malformed rlimit entry: {entry}"));
        };
        let Some((soft, hard)) = bounds.split_once(':') else {
            fail(&format!("malformed rlimit entry: {entry}"));
        };
        let resource = match resource_for_name(name) {
            Some(r) => r,
            None => fail(&format!("unknown rlimit: {name}")),
        };
        let soft: u64 = soft.parse().unwrap_or_else(|_| fail(&format!("bad rlimit soft value: {soft}")));
        let hard: u64 = hard.parse().unwrap_or_else(|_| fail(&format!("bad rlimit hard value: {hard}")));

        let limit = libc::rlimit {
            rlim_cur: soft,
            rlim_max: hard,
        };
        let rc = unsafe { libc::setrlimit(resource, &limit) };
        if rc != 0 {
            fail(&format!("setrlimit {name}: {}", std::io::Error::last_os_error()));
        }
    }
}

fn resource_for_name(name: &str) -> Option<libc::c_int> {
    Some(match name {
        "nofile" => libc::RLIMIT_NOFILE,
        "nproc" => libc::RLIMIT_NPROC,
        "core" => libc::RLIMIT_CORE,
        "cpu" => libc::RLIMIT_CPU,
        "fsize" => libc::RLIMIT_FSIZE,
        "as" => libc::RLIMIT_AS,
        "memlock" => libc::RLIMIT_MEMLOCK,
        _ => return None,
    })
}

fn resolve_in_path(program: &str) -> Result<PathBuf, std::io::Error> {
    if program.contains('/') {
        let path = PathBuf::from(program);
        return if path.is_file() {
            Ok(path)
        } else {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "not found"))
        };
    }

    let path_var = std::env::var_os("PATH").unwrap_or_default();
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(program);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    Err(std::io::Error::new(std::io::ErrorKind::NotFound, "not found in PATH"))
}

/// Drops every bounding capability not in [`KEPT_CAPABILITIES`], the
/// way `gocapability`'s `Apply(BOUNDING)` iterates `0..=cap_last_cap`.
fn drop_bounding_capabilities() -> Result<(), std::io::Error> {
    let last_cap = std::fs::read_to_string("/proc/sys/kernel/cap_last_cap")
        .ok()
        .and_then(|s| s.trim().parse::<libc::c_ulong>().ok())
        .unwrap_or(CAP_LAST_CAP_FALLBACK);

    for cap in 0..=last_cap {
        if KEPT_CAPABILITIES.contains(&cap) {
            continue;
        }
        let rc = unsafe { libc::prctl(libc::PR_CAPBSET_DROP, cap, 0, 0, 0) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            // EINVAL for a capability number the running kernel doesn't
            // define is expected once `cap` exceeds what this kernel knows.
            if err.raw_os_error() != Some(libc::EINVAL) {
                return Err(err);
            }
        }
    }
    Ok(())
}

/// Sets gid then uid via the raw syscall (matching the original's
/// `syscall.RawSyscall(SYS_SETGID/SYS_SETUID, ...)`, which bypasses any
/// library-level thread-state bookkeeping) and execs into `program`,
/// preserving the inherited environment.
fn exec_as(uid: libc::uid_t, gid: libc::gid_t, program_path: &std::path::Path, argv: &[String]) -> ! {
    unsafe {
        if libc::syscall(libc::SYS_setgid, gid) != 0 {
            fail(&format!("setgid: {}", std::io::Error::last_os_error()));
        }
        if libc::syscall(libc::SYS_setuid, uid) != 0 {
            fail(&format!("setuid: {}", std::io::Error::last_os_error()));
        }
    }

    let c_path = CString::new(program_path.as_os_str().as_bytes()).expect("path contains a NUL byte");
    let c_argv: Vec<CString> = argv
        .iter()
        .map(|a| CString::new(a.as_bytes()).expect("argument contains a NUL byte"))
        .collect();
    let mut argv_ptrs: Vec<*const libc::c_char> = c_argv.iter().map(|a| a.as_ptr()).collect();
    argv_ptrs.push(std::ptr::null());

    unsafe {
        libc::execv(c_path.as_ptr(), argv_ptrs.as_ptr());
    }
    fail(&format!("exec: {}", std::io::Error::last_os_error()));
}
