//! Sensor fusion for zone temperature estimates.
//!
//! Each zone's raw readings pass through a single-pole low-pass filter:
//!
//! ```text
//! alpha       = dt / (tau + dt)
//! filtered[n] = filtered[n-1] + alpha * (raw[n] - filtered[n-1])
//! ```
//!
//! Filtered values stay in sensor-referenced units. The aggregate ("drop
//! temperature") converts every zone through its calibration before averaging.

use pd_core::{ZoneId, ensure_finite};

use crate::calibration::DropCalibration;
use crate::error::{ControlError, ControlResult};

#[derive(Debug, Clone, PartialEq)]
struct FusionChannel {
    calibration: DropCalibration,
    raw: Option<f64>,
    filtered: Option<f64>,
}

/// Per-zone low-pass filters plus a cross-zone drop temperature estimate.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorFusion {
    tau_s: f64,
    channels: Vec<FusionChannel>,
}

impl SensorFusion {
    /// Create a fusion stage with one channel per calibration, in zone order.
    ///
    /// `tau_s` is the filter time constant in seconds; zero disables filtering.
    pub fn new(
        tau_s: f64,
        calibrations: impl IntoIterator<Item = DropCalibration>,
    ) -> ControlResult<Self> {
        ensure_finite(tau_s, "filter time constant")?;
        if tau_s < 0.0 {
            return Err(ControlError::InvalidArg {
                what: "filter time constant must be non-negative".to_string(),
            });
        }
        let channels: Vec<_> = calibrations
            .into_iter()
            .map(|calibration| FusionChannel {
                calibration,
                raw: None,
                filtered: None,
            })
            .collect();
        if channels.is_empty() {
            return Err(ControlError::InvalidArg {
                what: "sensor fusion needs at least one zone".to_string(),
            });
        }
        Ok(Self { tau_s, channels })
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn time_constant(&self) -> f64 {
        self.tau_s
    }

    /// Filter gain for a sample interval of `dt` seconds.
    ///
    /// A non-positive or non-finite `dt` yields 0, leaving the estimate as is.
    pub fn alpha(&self, dt: f64) -> f64 {
        if !dt.is_finite() || dt <= 0.0 {
            0.0
        } else if self.tau_s == 0.0 {
            1.0
        } else {
            dt / (self.tau_s + dt)
        }
    }

    /// Feed one raw sample for `zone` and return the new filtered value.
    ///
    /// The first sample seeds the filter directly.
    pub fn ingest(&mut self, zone: ZoneId, raw: f64, dt: f64) -> ControlResult<f64> {
        ensure_finite(raw, "raw temperature")?;
        let alpha = self.alpha(dt);
        let channel = self.channel_mut(zone)?;
        let filtered = match channel.filtered {
            Some(prev) => prev + alpha * (raw - prev),
            None => raw,
        };
        channel.raw = Some(raw);
        channel.filtered = Some(filtered);
        Ok(filtered)
    }

    /// Sensor-referenced filtered value for one zone.
    pub fn estimate(&self, zone: ZoneId) -> ControlResult<f64> {
        self.channel(zone)?
            .filtered
            .ok_or_else(|| ControlError::Unavailable {
                what: format!("no sample ingested for {zone}"),
            })
    }

    /// Drop-referenced filtered value for one zone.
    pub fn drop_estimate(&self, zone: ZoneId) -> ControlResult<f64> {
        let channel = self.channel(zone)?;
        let filtered = self.estimate(zone)?;
        Ok(channel.calibration.to_drop(filtered))
    }

    /// Most recent unfiltered sample for one zone.
    pub fn raw(&self, zone: ZoneId) -> Option<f64> {
        self.channel(zone).ok().and_then(|c| c.raw)
    }

    /// Mean drop-referenced estimate across all zones.
    ///
    /// Unavailable until every zone has received at least one sample.
    pub fn aggregate(&self) -> ControlResult<f64> {
        let mut sum = 0.0;
        for (index, channel) in self.channels.iter().enumerate() {
            let filtered = channel.filtered.ok_or_else(|| ControlError::Unavailable {
                what: format!(
                    "drop temperature needs a sample from every zone ({} has none)",
                    ZoneId::from_index(index)
                ),
            })?;
            sum += channel.calibration.to_drop(filtered);
        }
        Ok(sum / self.channels.len() as f64)
    }

    /// Forget all samples.
    pub fn reset(&mut self) {
        for channel in &mut self.channels {
            channel.raw = None;
            channel.filtered = None;
        }
    }

    fn channel(&self, zone: ZoneId) -> ControlResult<&FusionChannel> {
        self.channels
            .get(zone.index())
            .ok_or_else(|| ControlError::InvalidArg {
                what: format!("unknown {zone}"),
            })
    }

    fn channel_mut(&mut self, zone: ZoneId) -> ControlResult<&mut FusionChannel> {
        self.channels
            .get_mut(zone.index())
            .ok_or_else(|| ControlError::InvalidArg {
                what: format!("unknown {zone}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_zone(tau_s: f64) -> SensorFusion {
        SensorFusion::new(tau_s, [DropCalibration::offset(5.0); 2]).unwrap()
    }

    #[test]
    fn first_sample_seeds_filter() {
        let mut fusion = two_zone(10.0);
        let z0 = ZoneId::from_index(0);
        assert_eq!(fusion.ingest(z0, 42.0, 1.0).unwrap(), 42.0);
        assert_eq!(fusion.estimate(z0).unwrap(), 42.0);
        assert_eq!(fusion.raw(z0), Some(42.0));
    }

    #[test]
    fn low_pass_moves_fraction_of_step() {
        let mut fusion = two_zone(1.0);
        let z0 = ZoneId::from_index(0);
        fusion.ingest(z0, 20.0, 1.0).unwrap();
        // alpha = 1 / (1 + 1) = 0.5
        let filtered = fusion.ingest(z0, 30.0, 1.0).unwrap();
        assert!((filtered - 25.0).abs() < 1e-12);
    }

    #[test]
    fn zero_tau_passes_through() {
        let mut fusion = two_zone(0.0);
        let z0 = ZoneId::from_index(0);
        fusion.ingest(z0, 20.0, 1.0).unwrap();
        assert_eq!(fusion.ingest(z0, 33.0, 0.5).unwrap(), 33.0);
    }

    #[test]
    fn zero_dt_holds_filtered_value() {
        let mut fusion = two_zone(2.0);
        let z0 = ZoneId::from_index(0);
        fusion.ingest(z0, 20.0, 1.0).unwrap();
        assert_eq!(fusion.ingest(z0, 80.0, 0.0).unwrap(), 20.0);
        assert_eq!(fusion.raw(z0), Some(80.0));
    }

    #[test]
    fn non_finite_dt_holds_filtered_value() {
        let mut fusion = two_zone(2.0);
        let z0 = ZoneId::from_index(0);
        fusion.ingest(z0, 20.0, 1.0).unwrap();
        for dt in [f64::NAN, f64::INFINITY, -1.0] {
            assert_eq!(fusion.alpha(dt), 0.0);
            assert_eq!(fusion.ingest(z0, 80.0, dt).unwrap(), 20.0);
        }
        assert_eq!(fusion.estimate(z0).unwrap(), 20.0);
    }

    #[test]
    fn aggregate_unavailable_without_samples() {
        let fusion = two_zone(1.0);
        assert!(matches!(
            fusion.aggregate(),
            Err(ControlError::Unavailable { .. })
        ));
        assert!(matches!(
            fusion.estimate(ZoneId::from_index(1)),
            Err(ControlError::Unavailable { .. })
        ));
    }

    #[test]
    fn aggregate_unavailable_until_every_zone_sampled() {
        let mut fusion = two_zone(1.0);
        fusion.ingest(ZoneId::from_index(0), 65.0, 1.0).unwrap();
        assert!(fusion.aggregate().is_err());
        fusion.ingest(ZoneId::from_index(1), 67.0, 1.0).unwrap();
        // (65 - 5 + 67 - 5) / 2
        assert!((fusion.aggregate().unwrap() - 61.0).abs() < 1e-12);
    }

    #[test]
    fn reset_makes_estimates_unavailable() {
        let mut fusion = two_zone(1.0);
        fusion.ingest(ZoneId::from_index(0), 65.0, 1.0).unwrap();
        fusion.ingest(ZoneId::from_index(1), 65.0, 1.0).unwrap();
        fusion.reset();
        assert!(fusion.aggregate().is_err());
    }

    #[test]
    fn rejects_bad_input() {
        let mut fusion = two_zone(1.0);
        assert!(fusion.ingest(ZoneId::from_index(0), f64::NAN, 1.0).is_err());
        assert!(fusion.estimate(ZoneId::from_index(0)).is_err());
        assert!(fusion.ingest(ZoneId::from_index(5), 20.0, 1.0).is_err());
        assert!(SensorFusion::new(-1.0, [DropCalibration::offset(1.0)]).is_err());
        assert!(SensorFusion::new(1.0, Vec::<DropCalibration>::new()).is_err());
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn first_ingest_returns_raw(
            samples in prop::collection::vec(-50.0_f64..200.0, 1..20),
            tau in 0.0_f64..30.0,
            dt in 0.01_f64..5.0,
        ) {
            let mut fusion = SensorFusion::new(tau, [DropCalibration::offset(5.0)]).unwrap();
            let zone = ZoneId::from_index(0);
            let first = fusion.ingest(zone, samples[0], dt).unwrap();
            prop_assert_eq!(first, samples[0]);

            let lo = samples.iter().cloned().fold(f64::INFINITY, f64::min);
            let hi = samples.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            for &raw in &samples[1..] {
                let filtered = fusion.ingest(zone, raw, dt).unwrap();
                prop_assert!(filtered >= lo - 1e-9 && filtered <= hi + 1e-9);
            }
        }
    }
}
