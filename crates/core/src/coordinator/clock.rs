use tokio::time::Instant;

/// Animation time base, anchored to the player's "started" notifications.
#[derive(Debug, Default, Clone)]
pub struct AnimationClock {
    anchor: Option<Instant>,
    offset_seconds: f32,
}

impl AnimationClock {
    /// Starts (or restarts) counting from `offset` seconds into the clip.
    pub fn start(&mut self, offset: f32) {
        self.offset_seconds = offset.max(0.0);
        self.anchor = Some(Instant::now());
    }

    /// Freezes the clock at `position`.
    pub fn pause_at(&mut self, position: f32) {
        self.offset_seconds = position.max(0.0);
        self.anchor = None;
    }

    pub fn reset(&mut self) {
        self.offset_seconds = 0.0;
        self.anchor = None;
    }

    pub fn is_running(&self) -> bool {
        self.anchor.is_some()
    }

    pub fn elapsed(&self) -> f32 {
        match self.anchor {
            Some(anchor) => self.offset_seconds + anchor.elapsed().as_secs_f32(),
            None => self.offset_seconds,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn tracks_offset_pause_and_resume() {
        let mut clock = AnimationClock::default();
        assert!(!clock.is_running());
        assert_eq!(clock.elapsed(), 0.0);

        clock.start(1.0);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!((clock.elapsed() - 1.25).abs() < 1e-3);

        clock.pause_at(1.25);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(clock.elapsed(), 1.25);

        clock.reset();
        assert_eq!(clock.elapsed(), 0.0);
    }
}
