#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Noop,
    Grow,
    /// Tentative: the executor re-measures usage inside the image and may
    /// still demote to Noop.
    Shrink,
}

#[derive(Debug, Clone, Copy)]
pub struct ResizePlan {
    pub decision: Decision,
    pub target_sectors: u64,
    pub low_watermark: u64,
    pub high_watermark: u64,
}

/// Round half up, matching `floor(x + 0.5)`.
fn half_up(x: f64) -> u64 {
    (x + 0.5).floor() as u64
}

/// Target size and watermarks for a root filesystem using `used_sectors`,
/// keeping `pct_free` percent of the partition free.
pub fn watermarks(used_sectors: u64, pct_free: u32) -> (u64, u64, u64) {
    let delta = half_up(used_sectors as f64 * pct_free as f64 / (100 - pct_free) as f64);
    let target = used_sectors + delta;
    let half = half_up(delta as f64 / 2.0);
    (target, target - half, target + half)
}

/// Size for a freshly created image root: the target, no hysteresis.
pub fn plan_create(used_sectors: u64, pct_free: u32) -> u64 {
    watermarks(used_sectors, pct_free).0
}

/// Decide whether the existing image root should be resized.
pub fn plan_sync(used_sectors: u64, pct_free: u32, current_size: u64) -> ResizePlan {
    let (target, low, high) = watermarks(used_sectors, pct_free);
    let decision = if (low..=high).contains(&current_size) {
        Decision::Noop
    } else if target > current_size {
        Decision::Grow
    } else {
        Decision::Shrink
    };
    ResizePlan {
        decision,
        target_sectors: target,
        low_watermark: low,
        high_watermark: high,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_target_adds_free_headroom() {
        // 4,000,000 used at 20% free: delta = 4M * 20/80 = 1M.
        assert_eq!(plan_create(4_000_000, 20), 5_000_000);
    }

    #[test]
    fn watermarks_straddle_the_target() {
        let (target, low, high) = watermarks(4_000_000, 20);
        assert_eq!(target, 5_000_000);
        assert_eq!(low, 4_500_000);
        assert_eq!(high, 5_500_000);
    }

    #[test]
    fn rounding_is_half_up() {
        // 3 used at 25% free: delta = 3 * 25/75 = 1.0, half = 0.5 -> 1.
        let (target, low, high) = watermarks(3, 25);
        assert_eq!(target, 4);
        assert_eq!(low, 3);
        assert_eq!(high, 5);
    }

    #[test]
    fn stable_usage_is_a_noop() {
        // Image root is 5,000,000; usage drifted to 4,200,000.
        let plan = plan_sync(4_200_000, 20, 5_000_000);
        assert_eq!(plan.decision, Decision::Noop);
        assert!(plan.low_watermark <= 5_000_000 && 5_000_000 <= plan.high_watermark);
    }

    #[test]
    fn grown_usage_requests_grow() {
        let plan = plan_sync(8_000_000, 20, 5_000_000);
        assert_eq!(plan.decision, Decision::Grow);
        assert_eq!(plan.target_sectors, 10_000_000);
    }

    #[test]
    fn shrunk_usage_requests_tentative_shrink() {
        let plan = plan_sync(4_000_000, 20, 20_000_000);
        assert_eq!(plan.decision, Decision::Shrink);
        assert_eq!(plan.target_sectors, 5_000_000);
    }

    #[test]
    fn back_to_back_syncs_settle() {
        // After a resize to the target, a second run with the same usage
        // lands inside the band and does nothing.
        let first = plan_sync(6_000_000, 20, 5_000_000);
        assert_eq!(first.decision, Decision::Grow);
        let second = plan_sync(6_000_000, 20, first.target_sectors);
        assert_eq!(second.decision, Decision::Noop);
    }

    #[test]
    fn zero_percent_free_targets_used_exactly() {
        let (target, low, high) = watermarks(1_000_000, 0);
        assert_eq!(target, 1_000_000);
        assert_eq!(low, high);
    }
}
