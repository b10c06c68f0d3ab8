/// Staircase of learning rates indexed by epoch
///
/// Level `j` uses `base_rate * 10^(-j/7)` and is held for `3^j` epochs,
/// so epoch 1 is level 0, epochs 2..=4 level 1, epochs 5..=13 level 2,
/// and so on. Epochs after the last level keep the last rate.
#[derive(Clone, Debug)]
pub struct StaircaseSchedule {
    level_rates: Vec<f64>,
}

pub const DEFAULT_NUM_LEVELS: u32 = 8;

impl StaircaseSchedule {
    pub fn new(base_rate: f64, num_levels: u32) -> Self {
        let level_rates = (0..num_levels)
            .map(|j| base_rate * 10f64.powf(-(j as f64) / 7.0))
            .collect();
        Self { level_rates }
    }

    /// Learning rate for the 1-based `epoch`
    pub fn rate(&self, epoch: usize) -> anyhow::Result<f64> {
        if epoch == 0 {
            return Err(anyhow::anyhow!("epochs are counted from 1"));
        }
        let last = self
            .level_rates
            .last()
            .ok_or(anyhow::anyhow!("empty learning-rate schedule"))?;

        let mut remaining = epoch - 1;
        for (j, rate) in self.level_rates.iter().enumerate() {
            // a width past usize::MAX holds every remaining epoch
            match level_width(j) {
                Some(width) if remaining >= width => remaining -= width,
                _ => return Ok(*rate),
            }
        }
        Ok(*last)
    }

    pub fn num_levels(&self) -> usize {
        self.level_rates.len()
    }

    /// Last epoch before the final rate is held for good, or `None` if
    /// that epoch does not fit in `usize`
    pub fn num_scheduled_epochs(&self) -> Option<usize> {
        (0..self.level_rates.len()).try_fold(0usize, |acc, j| acc.checked_add(level_width(j)?))
    }
}

/// 3^j epochs, `None` on overflow
fn level_width(j: usize) -> Option<usize> {
    3usize.checked_pow(u32::try_from(j).ok()?)
}
