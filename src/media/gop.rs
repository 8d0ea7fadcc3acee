//! GOP cache for late joiners
//!
//! Holds up to `gop_num` groups of pictures, each starting at a video
//! keyframe. The group still being filled counts toward the limit, so with
//! `gop_num = 1` a new subscriber receives exactly the current GOP from its
//! keyframe. Packets that arrive before the first keyframe are not cached,
//! which also means audio-only streams never populate the cache.

use std::collections::VecDeque;

use super::packet::AvPacket;

#[derive(Debug)]
pub struct GopCache {
    gop_num: usize,
    gops: VecDeque<Vec<AvPacket>>,
}

impl GopCache {
    /// `gop_num = 0` disables caching
    pub fn new(gop_num: usize) -> Self {
        Self {
            gop_num,
            gops: VecDeque::with_capacity(gop_num + 1),
        }
    }

    pub fn gop_num(&self) -> usize {
        self.gop_num
    }

    pub fn push(&mut self, pkt: &AvPacket) {
        if self.gop_num == 0 {
            return;
        }

        if pkt.is_video() && pkt.is_keyframe() {
            self.gops.push_back(vec![pkt.clone()]);
            while self.gops.len() > self.gop_num {
                self.gops.pop_front();
            }
            return;
        }

        // audio and inter frames join the group current at arrival
        if let Some(current) = self.gops.back_mut() {
            current.push(pkt.clone());
        }
    }

    pub fn clear(&mut self) {
        self.gops.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.gops.is_empty()
    }

    pub fn gop_count(&self) -> usize {
        self.gops.len()
    }

    pub fn packet_count(&self) -> usize {
        self.gops.iter().map(Vec::len).sum()
    }

    /// All cached packets in arrival order, starting at the oldest keyframe
    pub fn iter(&self) -> impl Iterator<Item = &AvPacket> {
        self.gops.iter().flatten()
    }

    /// Packets of the newest `n` GOPs, starting at the oldest of their keyframes
    pub fn recent(&self, n: usize) -> impl Iterator<Item = &AvPacket> {
        let skip = self.gops.len().saturating_sub(n);
        self.gops.iter().skip(skip).flatten()
    }

    pub fn gops(&self) -> impl Iterator<Item = &[AvPacket]> {
        self.gops.iter().map(Vec::as_slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::nal::to_avcc;
    use crate::media::packet::PayloadType;
    use bytes::Bytes;

    fn key(ts: u32) -> AvPacket {
        AvPacket::video(PayloadType::Avc, ts, 0, to_avcc([&[0x65u8, 0x88][..]]))
    }

    fn inter(ts: u32) -> AvPacket {
        AvPacket::video(PayloadType::Avc, ts, 0, to_avcc([&[0x41u8, 0x9A][..]]))
    }

    fn audio(ts: u32) -> AvPacket {
        AvPacket::audio(ts, Bytes::from_static(&[0x21, 0x00]))
    }

    #[test]
    fn test_packets_before_first_keyframe_dropped() {
        let mut cache = GopCache::new(2);
        cache.push(&audio(0));
        cache.push(&inter(10));
        assert!(cache.is_empty());

        cache.push(&key(20));
        cache.push(&audio(21));
        assert_eq!(cache.gop_count(), 1);
        assert_eq!(cache.packet_count(), 2);
    }

    #[test]
    fn test_eviction_keeps_newest_gops() {
        let mut cache = GopCache::new(2);
        for g in 0..5u32 {
            cache.push(&key(g * 100));
            cache.push(&inter(g * 100 + 40));
            cache.push(&audio(g * 100 + 41));
        }
        assert_eq!(cache.gop_count(), 2);
        let first = cache.iter().next().unwrap();
        assert_eq!(first.timestamp, 300);
        assert!(first.is_keyframe());
    }

    #[test]
    fn test_every_gop_starts_with_keyframe() {
        let mut cache = GopCache::new(3);
        let seq = [key(0), inter(1), audio(2), inter(3), key(4), audio(5), key(6), inter(7)];
        for pkt in &seq {
            cache.push(pkt);
            assert!(cache.gop_count() <= 3);
            for gop in cache.gops() {
                assert!(gop[0].is_keyframe());
            }
        }
        let order: Vec<u32> = cache.iter().map(|p| p.timestamp).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_single_gop_holds_latest() {
        let mut cache = GopCache::new(1);
        cache.push(&key(0));
        cache.push(&inter(40));
        cache.push(&key(80));
        cache.push(&inter(120));
        let order: Vec<u32> = cache.iter().map(|p| p.timestamp).collect();
        assert_eq!(order, vec![80, 120]);
    }

    #[test]
    fn test_recent_gops() {
        let mut cache = GopCache::new(3);
        for g in 0..3u32 {
            cache.push(&key(g * 100));
            cache.push(&inter(g * 100 + 40));
        }
        let last: Vec<u32> = cache.recent(1).map(|p| p.timestamp).collect();
        assert_eq!(last, vec![200, 240]);
        assert_eq!(cache.recent(10).count(), 6);
        assert_eq!(cache.recent(0).count(), 0);
    }

    #[test]
    fn test_disabled_cache() {
        let mut cache = GopCache::new(0);
        cache.push(&key(0));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_clear() {
        let mut cache = GopCache::new(2);
        cache.push(&key(0));
        cache.clear();
        assert_eq!(cache.packet_count(), 0);
    }
}
