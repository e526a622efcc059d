//! Segmentation of a user transfer into hardware-legal segments
//!
//! Two policies, selected by the pipe's speed class. Full-speed pipes cap a
//! segment at 255 packets, each packet filled to the packet size with the
//! remainder in the last one. High-speed pipes require the total packet
//! count to be a multiple of 8 (8 micro-frames per millisecond frame), cap a
//! segment at 1024 packets, and spread the data as evenly as possible: a run
//! of packets filled to the brim, at most one packet carrying the leftover
//! on top of the minimum, and the rest carrying the minimum.
//!
//! Plans carry the true byte length of every packet. Whether those lengths
//! appear in the wire descriptor depends on direction and is decided when
//! the descriptor is built, not here.

use tracing::debug;

use crate::bus::SpeedClass;
use crate::error::TransferError;

/// Hard per-segment packet limit on the full-speed path.
pub const FULL_SPEED_MAX_PACKETS: u32 = 255;
/// Hard per-segment packet limit on the high-speed path.
pub const HIGH_SPEED_MAX_PACKETS: u32 = 1024;
/// High-speed packet counts must be a multiple of this.
pub const HIGH_SPEED_PACKET_MULTIPLE: u64 = 8;

/// One packet's position inside its segment, with its true byte length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketSlot {
    /// Byte offset relative to the segment.
    pub offset: u32,
    /// Bytes this packet carries.
    pub length: u32,
}

/// One hardware-legal segment of a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentPlan {
    /// Byte offset of this segment inside the request buffer.
    pub offset: u64,
    /// Byte length of this segment.
    pub length: u64,
    pub packets: Vec<PacketSlot>,
}

/// Complete segmentation of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferPlan {
    pub total_length: u64,
    pub packet_size: u32,
    pub segments: Vec<SegmentPlan>,
}

impl TransferPlan {
    pub fn packet_count(&self) -> u64 {
        self.segments.iter().map(|s| s.packets.len() as u64).sum()
    }
}

/// Compute the segmentation of `total_length` bytes for a pipe with the
/// given max packet size, under the policy `speed` selects.
pub fn plan_transfer(
    speed: SpeedClass,
    total_length: u64,
    packet_size: u32,
) -> Result<TransferPlan, TransferError> {
    if packet_size == 0 {
        return Err(TransferError::InvalidArgument(
            "packet size is zero".to_string(),
        ));
    }
    match speed {
        SpeedClass::Full => plan_full_speed(total_length, packet_size),
        SpeedClass::High => plan_high_speed(total_length, packet_size),
    }
}

/// Bounded packet count: segments of at most 255 packets, packets filled to
/// `packet_size` with the remainder in the final packet of the final segment.
fn plan_full_speed(total_length: u64, packet_size: u32) -> Result<TransferPlan, TransferError> {
    if total_length == 0 {
        // A segment with zero packets is never produced.
        return Err(TransferError::InvalidArgument(
            "zero-length transfer".to_string(),
        ));
    }

    let cap = packet_size as u64 * FULL_SPEED_MAX_PACKETS as u64;
    let mut segments = Vec::with_capacity(total_length.div_ceil(cap) as usize);
    let mut offset = 0u64;
    let mut remaining = total_length;

    while remaining > 0 {
        let stage = remaining.min(cap);
        let packet_count = stage.div_ceil(packet_size as u64) as u32;
        debug_assert!(packet_count <= FULL_SPEED_MAX_PACKETS);

        let mut packets = Vec::with_capacity(packet_count as usize);
        let mut packet_offset = 0u32;
        let mut left = stage;
        for _ in 0..packet_count {
            let length = left.min(packet_size as u64) as u32;
            packets.push(PacketSlot {
                offset: packet_offset,
                length,
            });
            packet_offset += length;
            left -= length as u64;
        }
        debug_assert_eq!(left, 0);

        segments.push(SegmentPlan {
            offset,
            length: stage,
            packets,
        });
        offset += stage;
        remaining -= stage;
    }

    debug!(
        "Planned full-speed transfer: {} bytes, packet size {}, {} segment(s)",
        total_length,
        packet_size,
        segments.len()
    );

    Ok(TransferPlan {
        total_length,
        packet_size,
        segments,
    })
}

/// Multiple-of-8 packet count with even distribution: round the packet count
/// up to a multiple of 8, give every packet the minimum share, fill a run of
/// packets to the brim with what remains, and put any final leftover into
/// the single packet after that run. The distribution counters are consumed
/// across segment boundaries, so segment byte lengths follow from the walk.
fn plan_high_speed(total_length: u64, packet_size: u32) -> Result<TransferPlan, TransferError> {
    let packet_size_w = packet_size as u64;
    if total_length < packet_size_w {
        return Err(TransferError::InvalidArgument(format!(
            "high-speed transfers need at least {} bytes, got {}",
            packet_size, total_length
        )));
    }

    let raw_packets = total_length.div_ceil(packet_size_w);
    let actual_packets = match raw_packets % HIGH_SPEED_PACKET_MULTIPLE {
        0 => raw_packets,
        rem => raw_packets + (HIGH_SPEED_PACKET_MULTIPLE - rem),
    };
    let min_per_packet = total_length / actual_packets;

    let (mut brim_left, mut extra_left) = if min_per_packet == packet_size_w {
        (actual_packets, 0)
    } else {
        let leftover = total_length - min_per_packet * actual_packets;
        let brim = leftover / (packet_size_w - min_per_packet);
        (brim, leftover - brim * (packet_size_w - min_per_packet))
    };

    debug!(
        "Planned high-speed distribution: {} bytes over {} packets ({} at {}, one at {}, rest at {})",
        total_length,
        actual_packets,
        brim_left,
        packet_size,
        min_per_packet + extra_left,
        min_per_packet
    );

    let mut segments =
        Vec::with_capacity(actual_packets.div_ceil(HIGH_SPEED_MAX_PACKETS as u64) as usize);
    let mut segment_offset = 0u64;
    let mut packets_left = actual_packets;

    while packets_left > 0 {
        let packet_count = packets_left.min(HIGH_SPEED_MAX_PACKETS as u64) as u32;

        let mut packets = Vec::with_capacity(packet_count as usize);
        let mut packet_offset = 0u64;
        for _ in 0..packet_count {
            let length = if brim_left > 0 {
                brim_left -= 1;
                packet_size_w
            } else if extra_left > 0 {
                let length = min_per_packet + extra_left;
                extra_left = 0;
                length
            } else {
                min_per_packet
            };
            packets.push(PacketSlot {
                offset: packet_offset as u32,
                length: length as u32,
            });
            packet_offset += length;
        }

        segments.push(SegmentPlan {
            offset: segment_offset,
            length: packet_offset,
            packets,
        });
        segment_offset += packet_offset;
        packets_left -= packet_count as u64;
    }
    debug_assert_eq!(segment_offset, total_length);

    Ok(TransferPlan {
        total_length,
        packet_size,
        segments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Every packet's offset is the running sum of the lengths before it,
    /// and the walk ends exactly at the segment's declared length.
    fn assert_packet_walk(segment: &SegmentPlan) {
        let mut expected_offset = 0u64;
        for packet in &segment.packets {
            assert_eq!(packet.offset as u64, expected_offset);
            expected_offset += packet.length as u64;
        }
        assert_eq!(expected_offset, segment.length);
    }

    #[test]
    fn test_full_speed_single_segment_remainder() {
        let plan = plan_transfer(SpeedClass::Full, 20, 8).unwrap();
        assert_eq!(plan.segments.len(), 1);
        let seg = &plan.segments[0];
        assert_eq!(seg.length, 20);
        let lengths: Vec<u32> = seg.packets.iter().map(|p| p.length).collect();
        assert_eq!(lengths, vec![8, 8, 4]);
        assert_packet_walk(seg);
    }

    #[test]
    fn test_full_speed_multi_segment() {
        // Two full segments of 255 packets plus a 5-byte tail.
        let total = 8 * 255 * 2 + 5;
        let plan = plan_transfer(SpeedClass::Full, total as u64, 8).unwrap();
        assert_eq!(plan.segments.len(), 3);
        assert_eq!(plan.segments[0].packets.len(), 255);
        assert_eq!(plan.segments[1].packets.len(), 255);
        assert_eq!(plan.segments[2].packets.len(), 1);
        assert_eq!(plan.segments[2].length, 5);
        assert_eq!(plan.segments[1].offset, 8 * 255);
        let sum: u64 = plan.segments.iter().map(|s| s.length).sum();
        assert_eq!(sum, total as u64);
        for seg in &plan.segments {
            assert_packet_walk(seg);
        }
    }

    #[test]
    fn test_full_speed_rejects_zero_length() {
        let err = plan_transfer(SpeedClass::Full, 0, 8).unwrap_err();
        assert!(matches!(err, TransferError::InvalidArgument(_)));
    }

    #[test]
    fn test_zero_packet_size_rejected() {
        assert!(plan_transfer(SpeedClass::Full, 64, 0).is_err());
        assert!(plan_transfer(SpeedClass::High, 64, 0).is_err());
    }

    #[test]
    fn test_high_speed_rejects_short_transfer() {
        let err = plan_transfer(SpeedClass::High, 7, 8).unwrap_err();
        assert!(matches!(err, TransferError::InvalidArgument(_)));
    }

    #[test]
    fn test_high_speed_exact_fit() {
        // 64 bytes over packet size 8: exactly 8 packets, all brim-full.
        let plan = plan_transfer(SpeedClass::High, 64, 8).unwrap();
        assert_eq!(plan.segments.len(), 1);
        assert_eq!(plan.packet_count(), 8);
        assert!(plan.segments[0].packets.iter().all(|p| p.length == 8));
        assert_packet_walk(&plan.segments[0]);
    }

    #[test]
    fn test_high_speed_example_8193_by_8() {
        // 8193 bytes at packet size 8: 1025 raw packets round up to 1032,
        // minimum 7 per packet, 969 brim packets of 8, the rest at 7.
        let plan = plan_transfer(SpeedClass::High, 8193, 8).unwrap();
        assert_eq!(plan.packet_count(), 1032);
        assert_eq!(plan.segments.len(), 2);
        assert_eq!(plan.segments[0].packets.len(), 1024);
        assert_eq!(plan.segments[1].packets.len(), 8);
        assert_eq!(plan.segments[0].length, 969 * 8 + 55 * 7);
        assert_eq!(plan.segments[1].length, 8 * 7);

        let mut eights = 0;
        let mut sevens = 0;
        for seg in &plan.segments {
            assert_packet_walk(seg);
            for p in &seg.packets {
                match p.length {
                    8 => eights += 1,
                    7 => sevens += 1,
                    other => panic!("unexpected packet length {}", other),
                }
            }
        }
        assert_eq!(eights, 969);
        assert_eq!(sevens, 63);

        let sum: u64 = plan.segments.iter().map(|s| s.length).sum();
        assert_eq!(sum, 8193);
    }

    #[test]
    fn test_high_speed_leftover_packet() {
        // 10 bytes at packet size 8: 8 packets, min 1 per packet, no brim
        // run, the leftover 2 bytes land in the first packet.
        let plan = plan_transfer(SpeedClass::High, 10, 8).unwrap();
        let lengths: Vec<u32> = plan.segments[0].packets.iter().map(|p| p.length).collect();
        assert_eq!(lengths, vec![3, 1, 1, 1, 1, 1, 1, 1]);
        assert_packet_walk(&plan.segments[0]);
    }

    proptest! {
        #[test]
        fn prop_full_speed_covers_every_byte(
            total in 1u64..200_000,
            packet_size in 1u32..2048,
        ) {
            let plan = plan_transfer(SpeedClass::Full, total, packet_size).unwrap();
            let sum: u64 = plan.segments.iter().map(|s| s.length).sum();
            prop_assert_eq!(sum, total);
            for seg in &plan.segments {
                prop_assert!(seg.packets.len() <= FULL_SPEED_MAX_PACKETS as usize);
                prop_assert!(!seg.packets.is_empty());
                let mut expected = 0u64;
                for p in &seg.packets {
                    prop_assert!(p.length > 0);
                    prop_assert!(p.length <= packet_size);
                    prop_assert_eq!(p.offset as u64, expected);
                    expected += p.length as u64;
                }
                prop_assert_eq!(expected, seg.length);
            }
        }

        #[test]
        fn prop_high_speed_multiple_of_eight(
            total in 1u64..200_000,
            packet_size in 1u32..2048,
        ) {
            prop_assume!(total >= packet_size as u64);
            let plan = plan_transfer(SpeedClass::High, total, packet_size).unwrap();
            prop_assert_eq!(plan.packet_count() % 8, 0);
            let sum: u64 = plan.segments.iter().map(|s| s.length).sum();
            prop_assert_eq!(sum, total);
            for seg in &plan.segments {
                prop_assert!(seg.packets.len() <= HIGH_SPEED_MAX_PACKETS as usize);
                let mut expected = 0u64;
                for p in &seg.packets {
                    prop_assert!(p.length <= packet_size);
                    prop_assert_eq!(p.offset as u64, expected);
                    expected += p.length as u64;
                }
                prop_assert_eq!(expected, seg.length);
            }
        }
    }
}
