//! Process-group usage probe backed by `/proc`

use crate::monitor::{RawCounters, UsageProbe};
#[cfg(target_os = "linux")]
use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

/// Samples memory and CPU time of every process in a process group
#[derive(Debug)]
pub struct ProcessGroupProbe {
    pgid: i32,
    page_size: u64,
    clock_ticks: u64,
    peak_memory: AtomicU64,
    cpu_time_ms: AtomicU64,
}

impl ProcessGroupProbe {
    pub fn new(pgid: i32) -> Self {
        // SAFETY: sysconf has no preconditions
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let clock_ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        Self {
            pgid,
            page_size: if page_size > 0 { page_size as u64 } else { 4096 },
            clock_ticks: if clock_ticks > 0 { clock_ticks as u64 } else { 100 },
            peak_memory: AtomicU64::new(0),
            cpu_time_ms: AtomicU64::new(0),
        }
    }

    pub fn pgid(&self) -> i32 {
        self.pgid
    }

    /// Highest resident memory seen so far
    pub fn peak_memory_bytes(&self) -> u64 {
        self.peak_memory.load(Ordering::Relaxed)
    }

    /// CPU time at the last successful sample
    pub fn cpu_time_ms(&self) -> u64 {
        self.cpu_time_ms.load(Ordering::Relaxed)
    }

    #[cfg(target_os = "linux")]
    fn read_group(&self) -> io::Result<Option<RawCounters>> {
        let mut found = false;
        let mut rss_pages = 0u64;
        let mut ticks = 0u64;

        for entry in std::fs::read_dir("/proc")? {
            let Ok(entry) = entry else { continue };
            let name = entry.file_name();
            let Some(pid) = name.to_str().filter(|s| s.bytes().all(|b| b.is_ascii_digit())) else {
                continue;
            };
            // Processes exit between listing and reading
            let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) else {
                continue;
            };
            let Some(stat) = parse_stat(&stat) else { continue };
            if stat.pgrp != self.pgid {
                continue;
            }
            found = true;
            rss_pages += stat.rss_pages;
            ticks += stat.utime + stat.stime;
        }

        if !found {
            return Ok(None);
        }
        Ok(Some(RawCounters {
            memory_bytes: rss_pages * self.page_size,
            cpu_time_ms: ticks * 1000 / self.clock_ticks,
            ..Default::default()
        }))
    }

    #[cfg(not(target_os = "linux"))]
    fn read_group(&self) -> io::Result<Option<RawCounters>> {
        Ok(None)
    }
}

impl UsageProbe for ProcessGroupProbe {
    fn sample(&self) -> io::Result<Option<RawCounters>> {
        let counters = self.read_group()?;
        if let Some(counters) = counters {
            self.peak_memory
                .fetch_max(counters.memory_bytes, Ordering::Relaxed);
            self.cpu_time_ms
                .fetch_max(counters.cpu_time_ms, Ordering::Relaxed);
        }
        Ok(counters)
    }
}

/// Every live process of a run: the group led by `root`, descendants of any member (they
/// leave the group with `setsid`), and processes whose environment holds `marker`
/// (orphans re-parented away from the tree)
#[cfg(target_os = "linux")]
pub(crate) fn run_members(root: i32, marker: &str) -> Vec<i32> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    let own = std::process::id() as i32;
    let mut parents = Vec::new();
    let mut members = HashSet::new();
    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<i32>().ok()) else {
            continue;
        };
        if pid == own {
            continue;
        }
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) else {
            continue;
        };
        let Some(stat) = parse_stat(&stat) else { continue };
        if pid == root || stat.pgrp == root || carries_marker(pid, marker) {
            members.insert(pid);
        }
        parents.push((pid, stat.ppid));
    }
    loop {
        let before = members.len();
        for (pid, ppid) in &parents {
            if members.contains(ppid) {
                members.insert(*pid);
            }
        }
        if members.len() == before {
            break;
        }
    }
    members.into_iter().collect()
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn run_members(_root: i32, _marker: &str) -> Vec<i32> {
    Vec::new()
}

#[cfg(target_os = "linux")]
fn carries_marker(pid: i32, marker: &str) -> bool {
    std::fs::read(format!("/proc/{}/environ", pid)).is_ok_and(|environ| {
        environ
            .split(|b| *b == 0)
            .any(|entry| entry == marker.as_bytes())
    })
}

#[derive(Debug, PartialEq, Eq)]
struct ProcStat {
    ppid: i32,
    pgrp: i32,
    utime: u64,
    stime: u64,
    rss_pages: u64,
}

/// Parse `/proc/<pid>/stat`. The command name may contain spaces and parentheses, so
/// fields are counted from the last `)`.
fn parse_stat(contents: &str) -> Option<ProcStat> {
    let rest = &contents[contents.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // fields[0] is field 3 (state)
    Some(ProcStat {
        ppid: fields.get(1)?.parse().ok()?,
        pgrp: fields.get(2)?.parse().ok()?,
        utime: fields.get(11)?.parse().ok()?,
        stime: fields.get(12)?.parse().ok()?,
        rss_pages: fields.get(21)?.parse().ok()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stat() {
        let line = "4242 (python3 (x) y) S 4200 4242 4200 0 -1 4194304 900 0 0 0 \
                    37 5 0 0 20 0 1 0 12345 20000000 2048 18446744073709551615";
        assert_eq!(
            parse_stat(line),
            Some(ProcStat {
                ppid: 4200,
                pgrp: 4242,
                utime: 37,
                stime: 5,
                rss_pages: 2048,
            })
        );
        assert_eq!(parse_stat("garbage"), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_samples_own_process_group() {
        // SAFETY: getpgrp has no preconditions
        let pgid = unsafe { libc::getpgrp() };
        let probe = ProcessGroupProbe::new(pgid);
        let counters = probe.sample().unwrap().expect("test process group has members");
        assert!(counters.memory_bytes > 0);
        assert_eq!(probe.peak_memory_bytes(), counters.memory_bytes);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_run_members_follow_marker_and_parentage() {
        use std::os::unix::process::CommandExt;

        let run_id = format!("test-{}", std::process::id());
        let marker = format!("CODECELL_RUN_ID={}", run_id);
        let mut detached = std::process::Command::new("/bin/sh")
            .args(["-c", "sleep 30 & wait"])
            .env("CODECELL_RUN_ID", &run_id)
            .process_group(0)
            .spawn()
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(200));

        // Unrelated root: the members are found through the marker alone
        let members = run_members(i32::MAX - 7, &marker);
        let shell = detached.id() as i32;
        assert!(members.contains(&shell));
        assert!(members.len() >= 2, "{members:?}");
        assert!(!members.contains(&(std::process::id() as i32)));

        for pid in members {
            // SAFETY: only signals the processes spawned above
            unsafe {
                libc::kill(pid, libc::SIGKILL);
            }
        }
        detached.wait().unwrap();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_missing_group_yields_none() {
        let probe = ProcessGroupProbe::new(i32::MAX - 7);
        assert_eq!(probe.sample().unwrap(), None);
    }
}
