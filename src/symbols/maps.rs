use std::io;

use crate::perf::sys::sys_move_pages;

/// Pages queried per move_pages(2) call.
const NUMA_MOVE_NPAGES: usize = 1024;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MapAttr {
    pub read: bool,
    pub write: bool,
    pub exec: bool,
    pub shared: bool,
}

/// A contiguous run of pages of one mapping resident on one node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NumaRange {
    pub start: u64,
    pub end: u64,
    pub nid: i32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MapEntry {
    pub start: u64,
    pub end: u64,
    pub attr: MapAttr,
    pub path: String,
    pub need_resolve: bool,
    pub numa: Vec<NumaRange>,
}

impl MapEntry {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }

    pub fn looks_like_so(&self) -> bool {
        self.path.contains(".so")
    }
}

fn parse_line(line: &str) -> Option<MapEntry> {
    let mut fields = line.split_whitespace();

    let range = fields.next()?;
    let (start, end) = range.split_once('-')?;
    let start = u64::from_str_radix(start, 16).ok()?;
    let end = u64::from_str_radix(end, 16).ok()?;

    let attrs = fields.next()?;
    let mut chars = attrs.chars();
    let attr = MapAttr {
        read: chars.next()? == 'r',
        write: chars.next()? == 'w',
        exec: chars.next()? == 'x',
        shared: chars.next()? == 's',
    };

    let _offset = fields.next()?;
    let _dev = fields.next()?;
    let _inode = fields.next()?;
    let path = fields.next().unwrap_or("").to_owned();

    Some(MapEntry {
        start,
        end,
        attr,
        path,
        need_resolve: true,
        numa: Vec::new(),
    })
}

/// Parse the content of a maps file. Unparsable lines are dropped; the
/// result is sorted by start address for range lookup.
pub fn parse(content: &str) -> Vec<MapEntry> {
    let mut entries: Vec<MapEntry> = content.lines().filter_map(parse_line).collect();
    entries.sort_by_key(|e| e.start);
    entries
}

pub fn read_maps(pid: i32) -> io::Result<Vec<MapEntry>> {
    let content = std::fs::read_to_string(format!("/proc/{pid}/maps"))?;
    let entries = parse(&content);
    if entries.is_empty() {
        return Err(io::ErrorKind::NotFound.into());
    }

    Ok(entries)
}

/// Re-read a process's maps, carrying the resolve state of entries that
/// are still present so their binaries are not parsed again.
pub fn reload(pid: i32, old: &[MapEntry]) -> io::Result<Vec<MapEntry>> {
    let mut new = read_maps(pid)?;
    for entry in new.iter_mut() {
        if let Some(prev) = old
            .iter()
            .find(|o| o.start == entry.start && o.end == entry.end)
        {
            entry.need_resolve = prev.need_resolve;
        }
    }

    Ok(new)
}

pub fn find_containing(entries: &[MapEntry], addr: u64) -> Option<&MapEntry> {
    let idx = entries.partition_point(|e| e.end <= addr);
    entries.get(idx).filter(|e| e.contains(addr))
}

pub fn find_exact<'a>(entries: &'a [MapEntry], addr: u64, size: u64) -> Option<&'a MapEntry> {
    find_containing(entries, addr).filter(|e| e.start == addr && e.end == addr + size)
}

/// Source of page→node residency answers. The real implementation asks
/// the kernel; tests substitute a fixed mapping.
pub trait NodeResident {
    fn resolve(&self, pid: i32, addrs: &[u64]) -> io::Result<Vec<i32>>;
}

pub struct MovePages;

impl NodeResident for MovePages {
    fn resolve(&self, pid: i32, addrs: &[u64]) -> io::Result<Vec<i32>> {
        let mut out = Vec::with_capacity(addrs.len());
        for chunk in addrs.chunks(NUMA_MOVE_NPAGES) {
            let pages: Vec<*mut libc::c_void> =
                chunk.iter().map(|a| *a as *mut libc::c_void).collect();
            let mut status = vec![0i32; chunk.len()];
            if sys_move_pages(pid, &pages, &mut status) != 0 {
                return Err(io::Error::last_os_error());
            }

            out.extend_from_slice(&status);
        }

        Ok(out)
    }
}

/// Resolve the home node of every page of one mapping and store the
/// result as merged per-node ranges.
pub fn map_to_numa(
    pid: i32,
    entry: &mut MapEntry,
    page_size: u64,
    resident: &dyn NodeResident,
) -> io::Result<()> {
    entry.numa.clear();

    let npages = (entry.len() / page_size) as usize;
    let addrs: Vec<u64> = (0..npages)
        .map(|i| entry.start + i as u64 * page_size)
        .collect();
    let nodes = resident.resolve(pid, &addrs)?;

    for (addr, nid) in addrs.iter().zip(nodes.iter()) {
        match entry.numa.last_mut() {
            Some(last) if last.nid == *nid && last.end == *addr => {
                last.end += page_size;
            }
            _ => entry.numa.push(NumaRange {
                start: *addr,
                end: *addr + page_size,
                nid: *nid,
            }),
        }
    }

    Ok(())
}

/// Per-node roll-up of a latency sample stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NodeDst {
    pub naccess: u64,
    pub total_lat: u64,
}

/// Attribute each sampled address to the node its page lives on. Pages
/// whose residency query fails (negative status) are not counted.
pub fn addr_to_nodedst(
    pid: i32,
    addrs: &[u64],
    lats: &[u64],
    nnodes: usize,
    page_size: u64,
    resident: &dyn NodeResident,
) -> io::Result<(Vec<NodeDst>, u64)> {
    let pages: Vec<u64> = addrs.iter().map(|a| a & !(page_size - 1)).collect();
    let nodes = resident.resolve(pid, &pages)?;

    let mut dst = vec![NodeDst::default(); nnodes];
    let mut total = 0;
    for (nid, lat) in nodes.iter().zip(lats.iter()) {
        if *nid >= 0 && (*nid as usize) < nnodes {
            dst[*nid as usize].naccess += 1;
            dst[*nid as usize].total_lat += lat;
            total += 1;
        }
    }

    Ok((dst, total))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub struct FixedResident(pub i32);

    impl NodeResident for FixedResident {
        fn resolve(&self, _pid: i32, addrs: &[u64]) -> io::Result<Vec<i32>> {
            Ok(vec![self.0; addrs.len()])
        }
    }

    const MAPS: &str = "\
00400000-0040c000 r-xp 00000000 08:02 1321238  /usr/bin/cat
0060d000-0062e000 rw-p 00000000 00:00 0        [heap]
40000000-41000000 rw-p 00000000 00:00 0        /tmp/buf
7ffff672c000-7ffff69db000 r--s 00001ac2 1f:33 1335289  /usr/lib/locale/locale-archive
7ffff5600000-7ffff5800000 rw-p 00000000 00:00 0
";

    #[test]
    fn parse_maps_lines() {
        let entries = parse(MAPS);
        assert_eq!(entries.len(), 5);

        let bin = &entries[0];
        assert_eq!(bin.start, 0x400000);
        assert_eq!(bin.end, 0x40c000);
        assert!(bin.attr.read && bin.attr.exec && !bin.attr.write);
        assert_eq!(bin.path, "/usr/bin/cat");

        let anon = entries.iter().find(|e| e.start == 0x7ffff5600000).unwrap();
        assert_eq!(anon.path, "");

        let shared = entries.iter().find(|e| e.attr.shared).unwrap();
        assert_eq!(shared.path, "/usr/lib/locale/locale-archive");
    }

    #[test]
    fn containment_and_exact_lookup() {
        let entries = parse(MAPS);
        let hit = find_containing(&entries, 0x4000_1000).unwrap();
        assert_eq!(hit.path, "/tmp/buf");
        assert!(find_containing(&entries, 0x3000_0000).is_none());

        assert!(find_exact(&entries, 0x4000_0000, 0x100_0000).is_some());
        assert!(find_exact(&entries, 0x4000_0000, 0x1000).is_none());
    }

    #[test]
    fn numa_ranges_merge_adjacent_pages() {
        struct Alternating;
        impl NodeResident for Alternating {
            fn resolve(&self, _pid: i32, addrs: &[u64]) -> io::Result<Vec<i32>> {
                // First half node 0, second half node 1.
                let half = addrs.len() / 2;
                Ok((0..addrs.len())
                    .map(|i| if i < half { 0 } else { 1 })
                    .collect())
            }
        }

        let mut entry = parse(MAPS)
            .into_iter()
            .find(|e| e.path == "/tmp/buf")
            .unwrap();
        map_to_numa(100, &mut entry, 4096, &Alternating).unwrap();

        assert_eq!(entry.numa.len(), 2);
        assert_eq!(entry.numa[0].nid, 0);
        assert_eq!(entry.numa[1].nid, 1);
        assert_eq!(entry.numa[0].end, entry.numa[1].start);
        assert_eq!(entry.numa[1].end, entry.end);
    }

    #[test]
    fn latency_stream_rolls_up_per_node() {
        // Scenario: one sample at 0x4000_1000, residency says node 1.
        let addrs = [0x4000_1000u64];
        let lats = [128u64];
        let (dst, total) =
            addr_to_nodedst(100, &addrs, &lats, 2, 4096, &FixedResident(1)).unwrap();

        assert_eq!(total, 1);
        assert_eq!(dst[0], NodeDst::default());
        assert_eq!(
            dst[1],
            NodeDst {
                naccess: 1,
                total_lat: 128
            }
        );
    }

    #[test]
    fn per_region_totals_match_stream() {
        let addrs = [0x1000u64, 0x2000, 0x3000, 0x4000];
        let lats = [10u64, 20, 30, 40];
        struct ByAddr;
        impl NodeResident for ByAddr {
            fn resolve(&self, _pid: i32, addrs: &[u64]) -> io::Result<Vec<i32>> {
                Ok(addrs.iter().map(|a| ((a >> 12) % 2) as i32).collect())
            }
        }

        let (dst, total) = addr_to_nodedst(1, &addrs, &lats, 2, 4096, &ByAddr).unwrap();
        assert_eq!(total, 4);
        assert_eq!(dst[0].naccess + dst[1].naccess, 4);
        assert_eq!(dst[0].total_lat + dst[1].total_lat, 100);
        assert_eq!(dst[1].naccess, 2);
        assert_eq!(dst[1].total_lat, 10 + 30);
    }
}
