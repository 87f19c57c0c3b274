//! Interrupt bandwidth tree.
//!
//! 63 skip-flagged dummy EDs in six levels. Level `k` has `2^k` nodes, each
//! polled every `2^k` ms. HCCA interrupt table entry `f` points at node
//! `(5, f)`; node `(k, j)` links to node `(k - 1, j % 2^(k-1))`, and the
//! single 1 ms node ends the list. Frame `f` therefore walks
//! `(5, f % 32), (4, f % 16), ... (0, 0)` and its load is the sum of those
//! nodes' loads.
//!
//! An interrupt ED is linked right after the node it is placed under.

use crate::dma::{BusAddr, DmaMemory};
use crate::error::{UsbError, UsbResult};
use crate::pool::{DescriptorPool, PoolItem};

use super::ed::{self, EdParams};

pub const LEVELS: usize = 6;
pub const NODE_COUNT: usize = (1 << LEVELS) - 1;
pub const FRAMES: usize = 32;

const fn node_index(level: usize, j: usize) -> usize {
    (1 << level) - 1 + j
}

/// Level serving a requested polling interval: the largest `k` with
/// `2^k <= interval`, capped at 32 ms.
pub fn level_for_interval(interval: u8) -> usize {
    let interval = interval.clamp(1, FRAMES as u8);
    (7 - interval.leading_zeros()) as usize
}

/// Where an interrupt endpoint went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub node: usize,
    pub level: usize,
    /// The least-loaded frame the choice was made for
    pub frame: usize,
}

pub struct BandwidthTree {
    nodes: [Option<PoolItem>; NODE_COUNT],
    load: [u32; NODE_COUNT],
}

impl BandwidthTree {
    /// Tree with load bookkeeping only, not yet backed by descriptors.
    pub fn new() -> Self {
        Self {
            nodes: [None; NODE_COUNT],
            load: [0; NODE_COUNT],
        }
    }

    /// Allocate the 63 dummy EDs, link them and fill the HCCA table.
    pub fn build<D: DmaMemory + ?Sized>(
        &mut self,
        mem: &mut D,
        pool: &mut DescriptorPool,
        hcca: BusAddr,
    ) -> UsbResult<()> {
        if pool.available() < NODE_COUNT {
            return Err(UsbError::NoMemory);
        }
        for slot in self.nodes.iter_mut() {
            let item = pool.get_item().ok_or(UsbError::NoMemory)?;
            ed::init_ed(mem, item.addr(), &EdParams::dummy());
            *slot = Some(item);
        }
        for level in 1..LEVELS {
            for j in 0..(1 << level) {
                let parent = node_index(level - 1, j % (1 << (level - 1)));
                let (Some(node), Some(parent)) = (self.nodes[node_index(level, j)], self.nodes[parent]) else {
                    continue;
                };
                ed::set_next_ed(mem, node.addr(), parent.addr());
            }
        }
        for f in 0..FRAMES {
            if let Some(node) = self.nodes[node_index(LEVELS - 1, f)] {
                mem.write_u32(hcca + (f as u32) * 4, node.addr());
            }
        }
        Ok(())
    }

    /// Return the dummy EDs to `pool`.
    pub fn release(&mut self, pool: &mut DescriptorPool) {
        for slot in self.nodes.iter_mut() {
            if let Some(item) = slot.take() {
                pool.put_item(item);
            }
        }
    }

    pub fn node_ed(&self, node: usize) -> Option<PoolItem> {
        self.nodes.get(node).copied().flatten()
    }

    /// Load seen by frame `f`.
    pub fn frame_load(&self, frame: usize) -> u32 {
        (0..LEVELS)
            .map(|k| self.load[node_index(k, frame % (1 << k))])
            .sum()
    }

    pub fn node_load(&self, node: usize) -> u32 {
        self.load.get(node).copied().unwrap_or(0)
    }

    /// Place an endpoint polled every `interval` ms costing `bandwidth`.
    ///
    /// The first least-loaded frame wins; the endpoint goes under the node of
    /// the requested level on that frame's path.
    pub fn insert_ep(&mut self, interval: u8, bandwidth: u32) -> Placement {
        let level = level_for_interval(interval);
        let mut frame = 0;
        let mut best = u32::MAX;
        for f in 0..FRAMES {
            let load = self.frame_load(f);
            if load < best {
                best = load;
                frame = f;
            }
        }
        let node = node_index(level, frame % (1 << level));
        self.load[node] += bandwidth;
        log::debug!(
            "ohci: interrupt ep every {} ms -> node {} (frame {}, load {})",
            1 << level,
            node,
            frame,
            best
        );
        Placement { node, level, frame }
    }

    pub fn remove_ep(&mut self, placement: Placement, bandwidth: u32) {
        match self.load.get_mut(placement.node) {
            Some(load) if *load >= bandwidth => *load -= bandwidth,
            _ => log::warn!("ohci: bandwidth underflow on node {}", placement.node),
        }
    }
}

impl Default for BandwidthTree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::DmaArena;
    use proptest::prelude::*;

    #[test]
    fn test_interval_levels() {
        assert_eq!(level_for_interval(0), 0);
        assert_eq!(level_for_interval(1), 0);
        assert_eq!(level_for_interval(3), 1);
        assert_eq!(level_for_interval(8), 3);
        assert_eq!(level_for_interval(10), 3);
        assert_eq!(level_for_interval(32), 5);
        assert_eq!(level_for_interval(255), 5);
    }

    #[test]
    fn test_build_links_every_frame_to_the_1ms_node() {
        let mut dma = DmaArena::new(64 * 1024, 0x8000_0000).unwrap();
        let hcca = dma.alloc(256, 256).unwrap();
        let mut pool = DescriptorPool::alloc(&mut dma, NODE_COUNT, ed::ED_SIZE, ed::ED_ALIGN).unwrap();
        let mut tree = BandwidthTree::new();
        tree.build(&mut dma, &mut pool, hcca).unwrap();
        let root = tree.node_ed(0).unwrap().addr();
        for f in 0..FRAMES as u32 {
            let mut addr = dma.read_u32(hcca + f * 4);
            let mut hops = 0;
            while addr != root {
                assert!(ed::is_skipped(&dma, addr));
                addr = ed::next_ed(&dma, addr);
                hops += 1;
                assert!(hops < LEVELS);
            }
            assert_eq!(hops, LEVELS - 1);
        }
        assert_eq!(ed::next_ed(&dma, root), 0);
        tree.release(&mut pool);
        assert_eq!(pool.checked_out(), 0);
    }

    #[test]
    fn test_spreads_same_interval_endpoints() {
        let mut tree = BandwidthTree::new();
        let a = tree.insert_ep(8, 64);
        let b = tree.insert_ep(8, 64);
        assert_eq!(a.level, 3);
        assert_ne!(a.node, b.node);
        tree.remove_ep(a, 64);
        let c = tree.insert_ep(8, 64);
        assert_eq!(c.node, a.node);
    }

    proptest! {
        #[test]
        fn prop_insert_picks_least_loaded_frame(
            eps in proptest::collection::vec((1u8..=64, 1u32..=64), 1..40)
        ) {
            let mut tree = BandwidthTree::new();
            for (interval, bw) in eps {
                let before: Vec<u32> = (0..FRAMES).map(|f| tree.frame_load(f)).collect();
                let placement = tree.insert_ep(interval, bw);
                let chosen = before[placement.frame];
                prop_assert!(before.iter().all(|&l| chosen <= l));
                // the node serves the chosen frame
                let level = placement.level;
                prop_assert_eq!(placement.node, (1 << level) - 1 + placement.frame % (1 << level));
            }
        }
    }
}
