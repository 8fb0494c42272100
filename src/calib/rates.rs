//! Line-rate reference math. Load values are percentages of the theoretical
//! maximum packet rate of a 10GbE link, which depends on the packet size.

/// 10GbE payload capacity in bytes per second.
const LINK_BYTES_PER_SEC: f64 = 1_250_000_000.0;

/// Preamble, start-of-frame delimiter and inter-frame gap; the CRC is already
/// part of the packet size.
const FRAME_OVERHEAD_BYTES: f64 = 20.0;

/// Theoretical maximum packets per second for a packet size across `n_ports`
/// 10GbE ports.
pub fn line_rate_to_pps(pkt_size: u32, n_ports: u32) -> f64 {
    n_ports as f64 * LINK_BYTES_PER_SEC / (pkt_size as f64 + FRAME_OVERHEAD_BYTES)
}

pub fn to_mpps(pps: f64) -> f64 {
    pps / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_64_byte_line_rate() {
        // The canonical 14.88 Mpps of 64-byte packets on 10GbE.
        let pps = line_rate_to_pps(64, 1);
        assert!((to_mpps(pps) - 14.88).abs() < 0.01);
    }

    #[test]
    fn test_scales_with_ports() {
        assert_eq!(line_rate_to_pps(64, 4), 4.0 * line_rate_to_pps(64, 1));
    }

    #[test]
    fn test_1518_byte_line_rate() {
        let pps = line_rate_to_pps(1518, 1);
        assert!((to_mpps(pps) - 0.8127).abs() < 0.001);
    }
}
