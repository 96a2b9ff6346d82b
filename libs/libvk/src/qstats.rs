//! Queue occupancy statistics

use tracing::info;

/// Occupancy samples for one queue in one direction
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    /// Max occupancy in the current window
    pub max_occ: u32,
    /// Max occupancy since reset
    pub max_abs: u32,
    /// Sum of samples in the current window
    pub acc_sum: u64,
    /// Samples in the current window
    pub cnt: u32,
}

impl QueueStats {
    /// Record one sample; every `interval` samples the window is logged and
    /// reset. An interval of 0 disables collection.
    pub fn update(&mut self, tag: &str, q_num: usize, occupancy: u32, interval: u32) {
        if interval == 0 {
            return;
        }

        if occupancy > self.max_occ {
            self.max_occ = occupancy;
            self.max_abs = self.max_abs.max(occupancy);
        }

        self.acc_sum += occupancy as u64;
        self.cnt += 1;
        if self.cnt >= interval {
            info!(
                "{}[{}]: Max: [{:3}/{:3}] Acc {} num {}, Aver {}",
                tag,
                q_num,
                self.max_occ,
                self.max_abs,
                self.acc_sum,
                self.cnt,
                self.acc_sum / self.cnt as u64
            );
            self.cnt = 0;
            self.max_occ = 0;
            self.acc_sum = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_rolls_over() {
        let mut stats = QueueStats::default();
        stats.update("h2vk", 0, 3, 2);
        assert_eq!(stats.cnt, 1);
        stats.update("h2vk", 0, 5, 2);
        assert_eq!(stats.cnt, 0);
        assert_eq!(stats.max_occ, 0);
        assert_eq!(stats.max_abs, 5);

        stats.update("h2vk", 0, 1, 2);
        assert_eq!(stats.max_occ, 1);
        assert_eq!(stats.max_abs, 5);
    }

    #[test]
    fn test_disabled() {
        let mut stats = QueueStats::default();
        stats.update("vk2h", 1, 7, 0);
        assert_eq!(stats, QueueStats::default());
    }
}
