use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};

use crate::error::{Error, Result};

pub const PQOS_FLAG_LLC: u32 = 1;
pub const PQOS_FLAG_TOTAL_BW: u32 = 2;
pub const PQOS_FLAG_LOCAL_BW: u32 = 4;

const RESCTRL_ROOT: &str = "/sys/fs/resctrl";

// Group id for whole-machine monitoring where no pid/tid names the group.
static ANON_GROUP_ID: AtomicI32 = AtomicI32::new(1_000_000);

/// LLC-occupancy / memory-bandwidth monitoring state of one task, backed
/// by a resctrl monitoring group. Bandwidth counters are cumulative in
/// the kernel; each sample stores the per-interval delta.
#[derive(Clone, Copy, Debug, Default)]
pub struct Pqos {
    pub task_id: i32,
    pub flags: u32,
    pub occupancy: u64,
    pub totalbw_last: u64,
    pub totalbw_scaled: u64,
    pub localbw_last: u64,
    pub localbw_scaled: u64,
}

pub fn resctrl_mounted() -> bool {
    PathBuf::from(RESCTRL_ROOT).join("tasks").exists()
}

fn group_dir(task_id: i32) -> PathBuf {
    PathBuf::from(RESCTRL_ROOT).join(format!("mon_groups/{task_id}"))
}

/// Create the monitoring group and attach the task. `tid` wins over `pid`
/// as the group name; with neither, an anonymous id is allocated.
pub fn task_setup(pid: i32, tid: i32, flags: u32) -> Result<Pqos> {
    if !resctrl_mounted() {
        return Err(Error::ResctrlUnavailable);
    }

    let task_id = if tid != 0 {
        tid
    } else if pid != 0 {
        pid
    } else {
        ANON_GROUP_ID.fetch_add(1, Ordering::Relaxed)
    };

    let dir = group_dir(task_id);
    let _ = fs::remove_dir(&dir);
    fs::create_dir_all(&dir).map_err(|source| Error::File {
        path: dir.clone(),
        source,
    })?;

    let member = if tid != 0 { tid } else { pid };
    if member != 0 {
        let tasks = dir.join("tasks");
        fs::write(&tasks, format!("{member}\n")).map_err(|source| Error::File {
            path: tasks,
            source,
        })?;
    }

    Ok(Pqos {
        task_id,
        flags,
        ..Pqos::default()
    })
}

fn mon_value(task_id: i32, field: &str) -> u64 {
    let mon_data = group_dir(task_id).join("mon_data");
    let Ok(entries) = fs::read_dir(&mon_data) else {
        return 0;
    };

    // One mon_L3_<nid> directory per node; sum them all.
    let mut sum = 0;
    for entry in entries.flatten() {
        if !entry.file_name().to_string_lossy().starts_with("mon_L3_") {
            continue;
        }

        if let Ok(content) = fs::read_to_string(entry.path().join(field)) {
            sum += content.trim().parse::<u64>().unwrap_or(0);
        }
    }

    sum
}

/// Read the group's current values: occupancy is instantaneous, the MBM
/// counters produce deltas against the previous read.
pub fn task_sample(pqos: &mut Pqos) {
    if pqos.task_id == 0 {
        return;
    }

    if pqos.flags & PQOS_FLAG_LLC != 0 {
        pqos.occupancy = mon_value(pqos.task_id, "llc_occupancy");
    }

    if pqos.flags & PQOS_FLAG_TOTAL_BW != 0 {
        let total = mon_value(pqos.task_id, "mbm_total_bytes");
        pqos.totalbw_scaled = total.wrapping_sub(pqos.totalbw_last);
        pqos.totalbw_last = total;
    }

    if pqos.flags & PQOS_FLAG_LOCAL_BW != 0 {
        let local = mon_value(pqos.task_id, "mbm_local_bytes");
        pqos.localbw_scaled = local.wrapping_sub(pqos.localbw_last);
        pqos.localbw_last = local;
    }
}

/// Remove the monitoring group; the kernel re-attaches the tasks to the
/// default group.
pub fn task_free(pqos: &mut Pqos) {
    if pqos.task_id != 0 {
        let _ = fs::remove_dir(group_dir(pqos.task_id));
    }

    *pqos = Pqos::default();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_group_ids_do_not_collide_with_pids() {
        let a = ANON_GROUP_ID.fetch_add(1, Ordering::Relaxed);
        let b = ANON_GROUP_ID.fetch_add(1, Ordering::Relaxed);
        assert!(a >= 1_000_000);
        assert_ne!(a, b);
    }

    #[test]
    fn bandwidth_is_delta_not_total() {
        let mut pqos = Pqos {
            task_id: 0,
            flags: PQOS_FLAG_TOTAL_BW,
            totalbw_last: 100,
            ..Pqos::default()
        };

        // task_id 0 is inert.
        task_sample(&mut pqos);
        assert_eq!(pqos.totalbw_last, 100);
    }
}
