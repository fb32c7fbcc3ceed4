//! Readers for the `/proc` files the ptrace backend needs.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::PathBuf;

use crate::error::Result;


/// A file-backed image mapped into a process.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MappedImage {
    pub path: PathBuf,
    pub base: u64,
    pub size: u64,
}

/// Read the file-backed mappings of `pid`, merged per path.
pub fn mapped_images(pid: u32) -> Result<Vec<MappedImage>> {
    let maps = fs::read_to_string(format!("/proc/{}/maps", pid))?;
    Ok(parse_maps(&maps))
}

/// Parse `/proc/<pid>/maps` text. Each path becomes one image spanning from its lowest
/// mapping start to its highest mapping end. Anonymous and pseudo mappings (`[heap]`,
/// `[vdso]`, ...) are skipped.
pub fn parse_maps(maps: &str) -> Vec<MappedImage> {
    let mut spans: BTreeMap<String, (u64, u64)> = BTreeMap::new();

    for line in maps.lines() {
        // address perms offset dev inode [path]
        let mut cols = line.splitn(6, ' ');
        let range = cols.next();
        let path = cols.nth(4).map(str::trim_start);

        let (range, path) = match (range, path) {
            (Some(range), Some(path)) if path.starts_with('/') => (range, path),
            _ => continue,
        };

        let (start, end) = match parse_range(range) {
            Some(span) => span,
            None => continue,
        };

        let span = spans.entry(path.to_owned()).or_insert((start, end));
        span.0 = span.0.min(start);
        span.1 = span.1.max(end);
    }

    let mut images: Vec<MappedImage> = spans
        .into_iter()
        .map(|(path, (start, end))| MappedImage {
            path: PathBuf::from(path),
            base: start,
            size: end - start,
        })
        .collect();
    images.sort_by_key(|image| image.base);
    images
}

fn parse_range(range: &str) -> Option<(u64, u64)> {
    let mut parts = range.splitn(2, '-');
    let start = u64::from_str_radix(parts.next()?, 16).ok()?;
    let end = u64::from_str_radix(parts.next()?, 16).ok()?;

    if end < start {
        return None;
    }

    Some((start, end))
}

/// Thread-group id (process id) of task `tid`, or `None` if the task is gone.
pub fn thread_group_id(tid: u32) -> Option<u32> {
    let status = fs::read_to_string(format!("/proc/{}/status", tid)).ok()?;
    parse_tgid(&status)
}

fn parse_tgid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("Tgid:"))
        .and_then(|tgid| tgid.trim().parse().ok())
}

/// Path of the executable image of `pid`.
pub fn exe_path(pid: u32) -> io::Result<PathBuf> {
    fs::read_link(format!("/proc/{}/exe", pid))
}

/// Thread ids of every task in process `pid`.
pub fn task_ids(pid: u32) -> io::Result<Vec<u32>> {
    let mut tids = vec![];

    for entry in fs::read_dir(format!("/proc/{}/task", pid))? {
        let name = entry?.file_name();

        if let Some(tid) = name.to_str().and_then(|s| s.parse().ok()) {
            tids.push(tid);
        }
    }

    tids.sort_unstable();
    Ok(tids)
}
