pub mod maps;

use std::io;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use object::{Object, ObjectSegment, ObjectSymbol};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use self::maps::MapEntry;

/// One function symbol, keyed by its offset from the binary's executable
/// load address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SymItem {
    pub off: u64,
    pub size: u64,
    pub name: String,
}

/// The sorted function-symbol table of one binary.
#[derive(Clone, Debug, Default)]
pub struct SymbolTable {
    items: Vec<SymItem>,
}

impl SymbolTable {
    #[cfg(test)]
    pub fn from_items(mut items: Vec<SymItem>) -> Self {
        items.sort_by_key(|i| i.off);
        SymbolTable { items }
    }

    pub fn load(path: &Path) -> io::Result<SymbolTable> {
        let file = std::fs::File::open(path)?;
        let mmap = unsafe { memmap2::Mmap::map(&file)? };
        let obj = object::File::parse(&*mmap)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        // The executable LOAD segment's vaddr anchors symbol offsets.
        let mut load_addr = None;
        for segment in obj.segments() {
            if let object::SegmentFlags::Elf { p_flags } = segment.flags() {
                if p_flags & 0x1 != 0 {
                    load_addr = Some(segment.address());
                    break;
                }
            }
        }
        let load_addr = load_addr.ok_or(io::ErrorKind::InvalidData)?;

        fn collect<'data, S, I>(symbols: I, load_addr: u64, items: &mut Vec<SymItem>)
        where
            S: ObjectSymbol<'data>,
            I: Iterator<Item = S>,
        {
            for sym in symbols {
                if sym.kind() != object::SymbolKind::Text || sym.size() == 0 {
                    continue;
                }
                let Ok(name) = sym.name() else { continue };
                items.push(SymItem {
                    off: sym.address().saturating_sub(load_addr),
                    size: sym.size(),
                    name: name.to_owned(),
                });
            }
        }

        let mut items = Vec::new();
        collect(obj.symbols(), load_addr, &mut items);
        if items.is_empty() {
            collect(obj.dynamic_symbols(), load_addr, &mut items);
        }

        items.sort_by(|a, b| a.off.cmp(&b.off));
        Ok(SymbolTable { items })
    }

    /// Look a binary-relative offset up. Among multiple symbols at the
    /// same address, one whose name does not start with an underscore
    /// wins.
    pub fn resolve(&self, off: u64) -> Option<&SymItem> {
        let idx = self.items.partition_point(|i| i.off + i.size <= off);
        let hit = self.items.get(idx)?;
        if off < hit.off {
            return None;
        }

        let mut best = hit;
        let mut i = idx;
        while i > 0 && self.items[i - 1].off == hit.off {
            i -= 1;
        }
        for item in self.items[i..].iter() {
            if item.off != hit.off {
                break;
            }
            if !item.name.starts_with('_') {
                best = item;
                break;
            }
        }

        Some(best)
    }
}

/// Shared-object tables are read once per path for the whole process
/// table; a failed parse is remembered so the file is not re-opened.
fn lib_cache() -> &'static Mutex<FxHashMap<String, Option<Arc<SymbolTable>>>> {
    static CACHE: OnceLock<Mutex<FxHashMap<String, Option<Arc<SymbolTable>>>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(FxHashMap::default()))
}

fn lib_lookup(path: &str) -> Option<Arc<SymbolTable>> {
    let mut cache = lib_cache().lock();
    if let Some(cached) = cache.get(path) {
        return cached.clone();
    }

    let loaded = SymbolTable::load(Path::new(path)).ok().map(Arc::new);
    if loaded.is_none() {
        log::debug!("symbol load failed for {path}");
    }
    cache.insert(path.to_owned(), loaded.clone());
    loaded
}

/// Per-process symbol state: the main image plus every mapped shared
/// object, each with the base address its offsets are relative to.
#[derive(Default)]
pub struct ProcSymbols {
    pub loaded: bool,
    image: Option<SymbolTable>,
    image_loadaddr: u64,
    libs: Vec<(Arc<SymbolTable>, u64)>,
    failed: FxHashSet<String>,
}

impl ProcSymbols {
    /// Parse whatever executable mappings still need resolving. Entries
    /// are marked resolved whether or not their binary parsed, so a bad
    /// file is attempted once.
    pub fn load(&mut self, maps: &mut [MapEntry]) {
        for entry in maps.iter_mut() {
            if !entry.need_resolve || !entry.attr.exec || entry.path.is_empty() {
                continue;
            }
            if entry.path.starts_with('[') || self.failed.contains(&entry.path) {
                entry.need_resolve = false;
                continue;
            }

            if entry.looks_like_so() {
                match lib_lookup(&entry.path) {
                    Some(table) => self.libs.push((table, entry.start)),
                    None => {
                        self.failed.insert(entry.path.clone());
                    }
                }
            } else {
                match SymbolTable::load(Path::new(&entry.path)) {
                    Ok(table) => {
                        self.image = Some(table);
                        self.image_loadaddr = entry.start;
                    }
                    Err(err) => {
                        log::debug!("symbol load failed for {}: {err}", entry.path);
                        self.failed.insert(entry.path.clone());
                    }
                }
            }

            entry.need_resolve = false;
        }

        self.loaded = true;
    }

    pub fn clear(&mut self) {
        *self = ProcSymbols::default();
    }

    /// Resolve an absolute IP to (symbol start address, size, name).
    pub fn resolve(&self, addr: u64) -> Option<(u64, u64, &str)> {
        if let Some(image) = &self.image {
            if let Some(item) = image.resolve(addr.wrapping_sub(self.image_loadaddr)) {
                return Some((self.image_loadaddr + item.off, item.size, &item.name));
            }
        }

        for (table, base) in &self.libs {
            if let Some(item) = table.resolve(addr.wrapping_sub(*base)) {
                return Some((base + item.off, item.size, &item.name));
            }
        }

        None
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallEntry {
    pub addr: u64,
    pub size: u64,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallChain {
    pub entries: Vec<CallEntry>,
    pub naccess: u64,
}

/// De-duplicated call chains: a chain whose every IP hits the same
/// `(addr, size)` windows as an existing chain bumps that chain's access
/// count instead of being stored again.
#[derive(Clone, Debug, Default)]
pub struct ChainList {
    chains: Vec<CallChain>,
}

fn ip_hit(ip: u64, addr: u64, size: u64) -> bool {
    ip >= addr && ip < addr + size
}

impl ChainList {
    pub fn add(&mut self, syms: &ProcSymbols, ips: &[u64]) {
        if ips.is_empty() {
            return;
        }

        if let Some(chain) = self.chains.iter_mut().find(|c| {
            ips.len() <= c.entries.len()
                && ips
                    .iter()
                    .zip(c.entries.iter())
                    .all(|(ip, e)| ip_hit(*ip, e.addr, e.size))
        }) {
            chain.naccess += 1;
            return;
        }

        let entries = ips
            .iter()
            .map(|ip| match syms.resolve(*ip) {
                Some((addr, size, name)) => CallEntry {
                    addr,
                    size,
                    name: name.to_owned(),
                },
                None => CallEntry {
                    addr: *ip,
                    size: std::mem::size_of::<u64>() as u64,
                    name: format!("{ip:#x}"),
                },
            })
            .collect();

        self.chains.push(CallChain {
            entries,
            naccess: 1,
        });
    }

    /// Order by access count, most frequent first.
    pub fn resort(&mut self) {
        self.chains.sort_by(|a, b| b.naccess.cmp(&a.naccess));
    }

    pub fn iter(&self) -> impl Iterator<Item = &CallChain> {
        self.chains.iter()
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> SymbolTable {
        SymbolTable::from_items(vec![
            SymItem {
                off: 0x100,
                size: 0x40,
                name: "_ZL9inner_fn".into(),
            },
            SymItem {
                off: 0x100,
                size: 0x40,
                name: "inner_fn".into(),
            },
            SymItem {
                off: 0x200,
                size: 0x80,
                name: "outer_fn".into(),
            },
        ])
    }

    #[test]
    fn resolve_prefers_plain_name_at_same_address() {
        let table = table();
        assert_eq!(table.resolve(0x110).unwrap().name, "inner_fn");
        assert_eq!(table.resolve(0x200).unwrap().name, "outer_fn");
        assert_eq!(table.resolve(0x27f).unwrap().name, "outer_fn");
        assert!(table.resolve(0x280).is_none());
        assert!(table.resolve(0x50).is_none());
    }

    #[test]
    fn unresolved_ips_fall_back_to_hex() {
        let syms = ProcSymbols::default();
        let mut list = ChainList::default();
        list.add(&syms, &[0xdead_beef]);

        let chain = list.iter().next().unwrap();
        assert_eq!(chain.entries[0].name, "0xdeadbeef");
    }

    #[test]
    fn identical_chains_count_instead_of_duplicating() {
        let mut syms = ProcSymbols::default();
        syms.image = Some(table());
        syms.image_loadaddr = 0x400000;
        syms.loaded = true;

        let mut list = ChainList::default();
        // Two IPs inside the same symbols, different exact addresses.
        list.add(&syms, &[0x400110, 0x400210]);
        list.add(&syms, &[0x400118, 0x400220]);
        // Disjoint chain: lands outside the known windows.
        list.add(&syms, &[0x400900]);

        assert_eq!(list.len(), 2);
        list.resort();
        let first = list.iter().next().unwrap();
        assert_eq!(first.naccess, 2);
        assert_eq!(first.entries[0].name, "inner_fn");
        assert_eq!(first.entries[1].name, "outer_fn");
    }
}
