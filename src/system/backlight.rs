//! Brightness control over the first sysfs backlight device. All writes go
//! through one task consuming a 1-deep command channel, so adjustments are
//! serialized and bursts collapse.

use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};

use crate::actors::EventSender;
use crate::config::Config;

const BACKLIGHT_ROOT: &str = "/sys/class/backlight";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BacklightCommand {
    Increase,
    Decrease,
    Dim,
    Restore,
}

pub(crate) struct Backlight {
    brightness_path: PathBuf,
    steps: Vec<u32>,
    dim_ratio: f64,
    saved: Option<u32>,
}

/// Discover the backlight device and start the control loop. Returns the
/// sender the rest of the system adjusts brightness through.
pub fn spawn(config: &Config) -> Result<EventSender<BacklightCommand>> {
    spawn_at(Path::new(BACKLIGHT_ROOT), config)
}

pub fn spawn_at(root: &Path, config: &Config) -> Result<EventSender<BacklightCommand>> {
    let mut backlight = Backlight::discover(root, config)?;
    let (sender, mut receiver) = EventSender::bounded(1);
    tokio::spawn(async move {
        while let Some(command) = receiver.recv().await {
            backlight.handle(command).await;
        }
    });
    Ok(sender)
}

impl Backlight {
    pub(crate) fn discover(root: &Path, config: &Config) -> Result<Backlight> {
        let device = std::fs::read_dir(root)
            .with_context(|| format!("could not read backlight devices in {}", root.display()))?
            .flatten()
            .next()
            .ok_or_else(|| anyhow!("no backlight devices found"))?;
        let device_path = device.path();
        let max_brightness: u32 = std::fs::read_to_string(device_path.join("max_brightness"))
            .context("could not read max brightness")?
            .trim()
            .parse()
            .context("invalid max brightness value")?;
        Ok(Backlight {
            brightness_path: device_path.join("brightness"),
            steps: brightness_steps(
                max_brightness,
                config.backlight_steps,
                config.backlight_curve_factor,
            ),
            dim_ratio: config.backlight_dim_ratio,
            saved: None,
        })
    }

    pub(crate) async fn handle(&mut self, command: BacklightCommand) {
        match command {
            BacklightCommand::Increase => self.increase().await,
            BacklightCommand::Decrease => self.decrease().await,
            BacklightCommand::Dim => self.dim().await,
            BacklightCommand::Restore => self.restore().await,
        }
    }

    async fn current(&self) -> Result<u32> {
        Ok(tokio::fs::read_to_string(&self.brightness_path)
            .await?
            .trim()
            .parse()?)
    }

    async fn write(&self, brightness: u32) {
        if let Err(e) =
            tokio::fs::write(&self.brightness_path, brightness.to_string()).await
        {
            log::error!("could not set brightness: {}", e);
        }
    }

    async fn increase(&self) {
        let current = match self.current().await {
            Ok(current) => current,
            Err(e) => {
                log::error!("could not read brightness: {}", e);
                return;
            }
        };
        if let Some(step) = self.steps.iter().copied().find(|&step| step > current) {
            self.write(step).await;
        }
    }

    async fn decrease(&self) {
        let current = match self.current().await {
            Ok(current) => current,
            Err(e) => {
                log::error!("could not read brightness: {}", e);
                return;
            }
        };
        if let Some(step) = self
            .steps
            .iter()
            .rev()
            .copied()
            .find(|&step| step < current)
        {
            self.write(step).await;
        }
    }

    async fn dim(&mut self) {
        let current = match self.current().await {
            Ok(current) => current,
            Err(e) => {
                log::error!("could not read brightness: {}", e);
                return;
            }
        };
        self.saved = Some(current);
        let dimmed = ((current as f64 * self.dim_ratio) as u32).max(1);
        self.write(dimmed).await;
    }

    async fn restore(&mut self) {
        if let Some(saved) = self.saved.take() {
            self.write(saved).await;
        }
    }
}

/// Compute the ascending brightness steps from 1 to `max_brightness` along
/// a power curve, deduplicated and midpoint-interpolated back up to
/// exactly `count` entries where the range allows.
pub(crate) fn brightness_steps(max_brightness: u32, count: usize, curve_factor: f64) -> Vec<u32> {
    // A degenerate step count collapses to the minimum level, like the
    // single-entry table the curve would otherwise dedupe down to.
    if count < 2 {
        return vec![1];
    }
    let max = max_brightness as f64;
    let mut raw = vec![0u32; count];
    raw[0] = 1;
    raw[count - 1] = max_brightness;
    for (i, step) in raw.iter_mut().enumerate().take(count - 1).skip(1) {
        let t = (i as f64 / (count - 1) as f64).powf(curve_factor);
        *step = max.powf(t).round() as u32;
    }

    let mut steps = vec![1u32];
    for &step in &raw[1..] {
        if step > *steps.last().unwrap() {
            steps.push(step);
        }
    }

    while steps.len() < count {
        let mut inserted = false;
        for i in 1..steps.len() {
            if steps[i] - steps[i - 1] > 1 {
                steps.insert(i, (steps[i] + steps[i - 1]) / 2);
                inserted = true;
                break;
            }
        }
        // No gap left to split.
        if !inserted {
            break;
        }
    }

    steps.truncate(count);
    steps
}
