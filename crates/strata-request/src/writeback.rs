//! Background writeback.
//!
//! One worker per cached device: it scans the extents tree for dirty
//! keys under the exclusive side of the writeback lock (so foreground
//! writes never race the refill), queues them in the keybuf, then
//! copies each range from the cache to the backing device and re-keys
//! it as a clean cached extent. The copy rate follows the dirty-percent
//! controller.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use strata_core::PdController;
use strata_error::{Result, StrataError};
use strata_types::{
    Bkey, Bpos, BtreeId, Bval, CacheMode, Extent, ExtentCrc, IoDir, KeyType, KeyVal,
    SECTOR_SHIFT,
};
use tracing::{debug, trace, warn};

use crate::{BdevState, CachedDev};

/// Dirty keys queued per refill pass.
const REFILL_BATCH: usize = 32;

const IDLE_SLEEP: Duration = Duration::from_millis(20);

pub(crate) fn spawn(dc: Arc<CachedDev>) -> Result<JoinHandle<()>> {
    let weak = Arc::downgrade(&dc);
    let shutdown = Arc::clone(&dc.writeback_shutdown);
    drop(dc);
    std::thread::Builder::new()
        .name("strata-writeback".to_owned())
        .spawn(move || {
            let mut pd = PdController::default();
            let mut cursor = Bpos::MIN;
            while !shutdown.load(Ordering::Acquire) {
                let Some(dc) = weak.upgrade() else {
                    return;
                };
                match writeback_pass(&dc, &mut pd, &mut cursor) {
                    Ok(true) => {}
                    Ok(false) => {
                        drop(dc);
                        std::thread::sleep(IDLE_SLEEP);
                    }
                    Err(err) => {
                        warn!(
                            target: "strata::request::writeback",
                            event = "writeback_error",
                            error = %err
                        );
                        drop(dc);
                        std::thread::sleep(IDLE_SLEEP);
                    }
                }
            }
        })
        .map_err(StrataError::Io)
}

/// One refill-and-drain pass. Returns whether any work was done.
fn writeback_pass(
    dc: &Arc<CachedDev>,
    pd: &mut PdController,
    cursor: &mut Bpos,
) -> Result<bool> {
    let config = dc.config();
    if !config.writeback_running || config.cache_mode != CacheMode::Writeback {
        return Ok(false);
    }

    let found_dirty = refill_keybuf(dc, cursor)?;

    let capacity = dc.set.capacity_sectors().max(1);
    let target = capacity * u64::from(config.writeback_percent) / 100;
    let rate = pd.next_rate(dc.dirty_sectors.load(Ordering::Relaxed), target);

    let mut moved = 0_u64;
    while let Some(kv) = dc.keybuf.next_pending() {
        match write_one_back(dc, &kv) {
            Ok(sectors) => {
                dc.keybuf.del(&kv);
                dc.writeback_done(u64::from(sectors));
                moved += u64::from(sectors);
            }
            Err(err) => {
                warn!(
                    target: "strata::request::writeback",
                    event = "writeback_key_failed",
                    inode = kv.k.p.inode,
                    offset = kv.k.p.offset,
                    error = %err
                );
                dc.keybuf.del(&kv);
            }
        }
        if moved >= rate {
            break;
        }
    }

    if moved == 0 && dc.keybuf.is_empty() {
        if !found_dirty {
            // The dirty counter is approximate (superseded writes stay
            // counted); a clean full scan is the ground truth.
            dc.dirty_sectors.store(0, Ordering::Relaxed);
        }
        if dc.dirty_sectors.load(Ordering::Relaxed) == 0 && dc.state() == BdevState::Dirty {
            dc.set_state(BdevState::Clean);
        }
        return Ok(false);
    }
    Ok(moved > 0)
}

/// Scan forward from the cursor for dirty extents and queue them.
/// Returns whether any dirty key exists for this device at all.
fn refill_keybuf(dc: &Arc<CachedDev>, cursor: &mut Bpos) -> Result<bool> {
    if dc.keybuf.len() >= REFILL_BATCH {
        return Ok(true);
    }
    // Exclusive against foreground writes choosing their path.
    let _wb = dc.writeback_lock.write();

    let btree = Arc::clone(&dc.set.btree);
    let mut iter = btree.iter(BtreeId::Extents, *cursor);
    let mut queued = dc.keybuf.len();
    let mut found_dirty = queued > 0;
    let mut wrapped = *cursor == Bpos::new(dc.inode, 0);

    while queued < REFILL_BATCH {
        let hop = match iter.peek()? {
            Some(kv) if kv.k.p.inode == dc.inode => {
                if kv.k.ty == KeyType::Extent {
                    found_dirty = true;
                    if !dc.keybuf.contains(kv.k.p) {
                        dc.keybuf.add(kv.clone());
                        queued += 1;
                        trace!(
                            target: "strata::request::writeback",
                            event = "keybuf_refill",
                            inode = kv.k.p.inode,
                            offset = kv.k.p.offset
                        );
                    }
                }
                *cursor = kv.k.p;
                iter.advance_pos();
                false
            }
            _ => true,
        };
        if hop {
            if wrapped {
                break;
            }
            wrapped = true;
            *cursor = Bpos::new(dc.inode, 0);
            iter.set_pos(*cursor);
        }
    }
    Ok(found_dirty)
}

/// Copy one dirty key's range from the cache to the backing device and
/// re-key it clean. Returns the sectors moved.
fn write_one_back(dc: &Arc<CachedDev>, kv: &KeyVal) -> Result<u32> {
    let Some(extent) = kv.v.as_extent() else {
        return Ok(0);
    };
    let Some(ptr) = extent.ptrs.iter().find(|ptr| !dc.set.devs.ptr_stale(ptr)) else {
        // Invalidated under us; the data is gone from the cache, and a
        // dirty extent with no live pointer means the write that made
        // it dirty has since been superseded.
        return Ok(0);
    };
    let device = dc
        .set
        .devs
        .device(ptr.dev)
        .ok_or(StrataError::NoDisk)?;

    let sectors = kv.k.size;
    let mut buf = vec![0_u8; (sectors as usize) << SECTOR_SHIFT as usize];
    device.dev.read_sectors(ptr.offset, &mut buf)?;
    if device.ptr_stale(ptr) {
        return Ok(0);
    }
    device.touch_bucket(ptr.bucket(device.bucket_sectors()), IoDir::Read);

    let start = kv.k.start();
    dc.backing.write_sectors(start.offset, &buf)?;

    // Same data, same pointers, clean type: reads now treat it as a
    // cached copy of the backing device. The swap only lands if the
    // dirty key is still exactly the one we copied; a foreground write
    // that superseded it must not be clobbered.
    let clean = KeyVal::new(
        Bkey::new(kv.k.p, kv.k.size, KeyType::CachedExtent),
        Bval::Extent(Extent {
            ptrs: extent.ptrs.clone(),
            crc: Some(ExtentCrc {
                csum: crc32c::crc32c(&buf),
                uncompressed_sectors: sectors,
                compression: strata_types::CompressionType::None,
            }),
        }),
    );
    if !dc.set.btree.insert_replace(BtreeId::Extents, clean, kv)? {
        return Ok(0);
    }

    debug!(
        target: "strata::request::writeback",
        event = "wrote_back",
        inode = kv.k.p.inode,
        offset = start.offset,
        sectors = sectors
    );
    Ok(sectors)
}
