//! Per-call-site inline method caches.
//!
//! Each `CallMethod` site owns [`CACHE_LINES`] lines ordered most recently
//! used first. A hit is moved to the front; a miss installs the resolved
//! target at the front and shifts the rest back, dropping the last one.
//! Lines remember the world epoch they were filled in and stop matching once
//! it moves on.

use crate::BlockId;
use crate::types::TypeId;

pub const CACHE_LINES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionKind {
    Method,
    ModuleMember,
    MapKey,
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLine {
    pub type_id: TypeId,
    pub kind: ResolutionKind,
    pub target: Option<BlockId>,
    pub epoch: u64,
}

#[derive(Debug, Clone, Default)]
pub struct InlineCache {
    lines: [Option<CacheLine>; CACHE_LINES],
}

impl InlineCache {
    pub fn lookup(&mut self, type_id: TypeId, epoch: u64) -> Option<CacheLine> {
        let pos = self.lines.iter().position(|line| {
            line.is_some_and(|l| l.type_id == type_id && l.epoch == epoch)
        })?;
        let line = self.lines[pos];
        self.lines[..=pos].rotate_right(1);
        line
    }

    pub fn insert(&mut self, line: CacheLine) {
        // drop any stale line for the same type
        if let Some(pos) = self
            .lines
            .iter()
            .position(|l| l.is_some_and(|l| l.type_id == line.type_id))
        {
            self.lines[pos] = None;
            self.lines[pos..].rotate_left(1);
        }
        self.lines.rotate_right(1);
        self.lines[0] = Some(line);
    }

    pub fn lines(&self) -> impl Iterator<Item = &CacheLine> {
        self.lines.iter().flatten()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// All inline caches of one stack, indexed by program and call site.
#[derive(Debug, Clone, Default)]
pub struct InlineCaches {
    programs: Vec<Vec<InlineCache>>,
    pub stats: CacheStats,
}

impl InlineCaches {
    pub fn site(&mut self, program: usize, site: usize) -> &mut InlineCache {
        if self.programs.len() <= program {
            self.programs.resize_with(program + 1, Vec::new);
        }
        let sites = &mut self.programs[program];
        if sites.len() <= site {
            sites.resize_with(site + 1, InlineCache::default);
        }
        &mut sites[site]
    }

    pub fn clear(&mut self) {
        self.programs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(ty: u32, epoch: u64) -> CacheLine {
        CacheLine {
            type_id: TypeId(ty),
            kind: ResolutionKind::Method,
            target: Some(BlockId(ty)),
            epoch,
        }
    }

    fn order(cache: &InlineCache) -> Vec<u32> {
        cache.lines().map(|l| l.type_id.0).collect()
    }

    #[test]
    fn hit_moves_to_front() {
        let mut cache = InlineCache::default();
        cache.insert(line(1, 0));
        cache.insert(line(2, 0));
        cache.insert(line(3, 0));
        assert_eq!(order(&cache), vec![3, 2, 1]);

        assert_eq!(cache.lookup(TypeId(1), 0), Some(line(1, 0)));
        assert_eq!(order(&cache), vec![1, 3, 2]);
    }

    #[test]
    fn miss_evicts_least_recently_used() {
        let mut cache = InlineCache::default();
        for ty in 1..=CACHE_LINES as u32 {
            cache.insert(line(ty, 0));
        }
        cache.lookup(TypeId(1), 0);
        cache.insert(line(9, 0));
        assert_eq!(order(&cache), vec![9, 1, 4, 3]);
        assert_eq!(cache.lookup(TypeId(2), 0), None);
    }

    #[test]
    fn stale_epoch_misses_and_is_replaced() {
        let mut cache = InlineCache::default();
        cache.insert(line(1, 0));
        cache.insert(line(2, 0));
        assert_eq!(cache.lookup(TypeId(1), 1), None);
        cache.insert(line(1, 1));
        assert_eq!(order(&cache), vec![1, 2]);
        assert_eq!(cache.lookup(TypeId(1), 1), Some(line(1, 1)));
    }

    #[test]
    fn sites_grow_on_demand() {
        let mut caches = InlineCaches::default();
        caches.site(2, 3).insert(line(5, 0));
        assert_eq!(caches.site(2, 3).lookup(TypeId(5), 0), Some(line(5, 0)));
        assert_eq!(caches.site(0, 0).lookup(TypeId(5), 0), None);
    }
}
