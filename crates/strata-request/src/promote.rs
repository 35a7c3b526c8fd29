//! Cache promotion (experimental, behind the `promote` feature).
//!
//! After a miss was served from the backing device and a cookie
//! reservation landed, the data is written into the cache through the
//! promote write point and keyed as a clean cached extent. The insert
//! only proceeds while the cookie is still in place; a foreground write
//! that raced us replaces the cookie, and the promote is dropped.

use strata_types::{Bpos, BtreeId, KeyType};
use tracing::trace;

use crate::{data_write, CachedDev, WRITE_ALLOC_NOWAIT, WRITE_CACHED};

pub(crate) fn promote_after_miss(dc: &CachedDev, sector: u64, sectors: u32, data: &[u8]) {
    let set = &dc.set;
    if !set.has_cache_headroom() {
        return;
    }

    // The cookie guards the range; if it is gone a racing write owns
    // the range now.
    let guard = set
        .btree
        .lookup(BtreeId::Extents, Bpos::new(dc.inode, sector))
        .ok()
        .flatten();
    let cookie_intact = guard.is_some_and(|kv| {
        kv.k.ty == KeyType::Cookie && kv.k.covers(Bpos::new(dc.inode, sector))
    });
    if !cookie_intact {
        trace!(
            target: "strata::request::promote",
            event = "promote_dropped",
            inode = dc.inode,
            sector = sector
        );
        return;
    }

    let result = data_write(
        set,
        &set.devs.wps.promote,
        dc.inode,
        sector,
        sectors,
        data,
        WRITE_CACHED | WRITE_ALLOC_NOWAIT,
    );
    match result {
        Ok(()) => trace!(
            target: "strata::request::promote",
            event = "promoted",
            inode = dc.inode,
            sector = sector,
            sectors = sectors
        ),
        Err(err) => trace!(
            target: "strata::request::promote",
            event = "promote_failed",
            error = %err
        ),
    }
}
