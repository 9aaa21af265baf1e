use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::config::PlaybackConfig;

/// Engine-wide volume and mute.
///
/// Read once when a player is constructed; changing it afterwards does not
/// touch players that already exist.
#[derive(Debug)]
pub struct VolumeControl {
    volume: AtomicU32,
    muted: AtomicBool,
}

impl VolumeControl {
    pub fn new(volume: f32, muted: bool) -> Self {
        Self {
            volume: AtomicU32::new(volume.clamp(0.0, 1.0).to_bits()),
            muted: AtomicBool::new(muted),
        }
    }

    pub fn from_config(config: &PlaybackConfig) -> Self {
        Self::new(config.volume, config.muted)
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Relaxed))
    }

    pub fn set_volume(&self, volume: f32) {
        self.volume
            .store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    /// Gain a newly built player starts with.
    pub fn effective_volume(&self) -> f32 {
        if self.is_muted() {
            0.0
        } else {
            self.volume()
        }
    }
}

impl Default for VolumeControl {
    fn default() -> Self {
        Self::new(1.0, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mute_overrides_volume() {
        let control = VolumeControl::default();
        control.set_volume(0.6);
        assert_eq!(control.effective_volume(), 0.6);

        control.set_muted(true);
        assert_eq!(control.effective_volume(), 0.0);
        assert_eq!(control.volume(), 0.6);
    }

    #[test]
    fn clamps_out_of_range_levels() {
        let control = VolumeControl::new(3.0, false);
        assert_eq!(control.volume(), 1.0);
        control.set_volume(-1.0);
        assert_eq!(control.volume(), 0.0);
    }
}
