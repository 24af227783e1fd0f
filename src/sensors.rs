//! Seams for the auxiliary sensors owned by the surrounding glue code.
//!
//! GPS, gas/environment/power/acceleration and the secondary particulate
//! sensor are exposed to this core as plain value-producing calls: a reading
//! or the -1 sentinel, never an error. The mock implementations serve tests
//! and bench-top runs without hardware, producing plausible jittered values.

use crate::record::{AuxReading, GpsFix, SecondaryPmReading};
use async_trait::async_trait;

/// Source of GPS fixes. No fix means all-sentinel values.
#[async_trait]
pub trait GpsSource: Send + Sync {
    async fn fix(&self) -> GpsFix;
}

/// Gas, temperature, pressure, humidity, power and acceleration values.
#[async_trait]
pub trait AuxSensors: Send + Sync {
    async fn read(&self) -> AuxReading;
}

/// The secondary particulate sensor (four-channel).
#[async_trait]
pub trait SecondaryPmSensor: Send + Sync {
    async fn read(&self) -> SecondaryPmReading;
}

/// Mock sensors for tests and hardware-less runs.
pub mod mock {
    use super::*;
    use rand::Rng;

    /// Fixed position with a small jitter on the error estimate.
    pub struct MockGps {
        pub latitude: f64,
        pub longitude: f64,
    }

    impl Default for MockGps {
        fn default() -> Self {
            Self {
                latitude: 38.736,
                longitude: -9.143,
            }
        }
    }

    #[async_trait]
    impl GpsSource for MockGps {
        async fn fix(&self) -> GpsFix {
            GpsFix {
                latitude: self.latitude,
                longitude: self.longitude,
                error: rand::thread_rng().gen_range(0.8..2.0),
            }
        }
    }

    /// GPS source that never has a fix.
    pub struct NoFixGps;

    #[async_trait]
    impl GpsSource for NoFixGps {
        async fn fix(&self) -> GpsFix {
            GpsFix::NO_FIX
        }
    }

    /// Plausible indoor readings with mild noise.
    #[derive(Default)]
    pub struct MockAuxSensors;

    #[async_trait]
    impl AuxSensors for MockAuxSensors {
        async fn read(&self) -> AuxReading {
            let mut rng = rand::thread_rng();
            AuxReading {
                gas_co_1: rng.gen_range(0.3..0.7),
                gas_co_2: rng.gen_range(0.3..0.7),
                gas_no2_1: rng.gen_range(0.1..0.4),
                gas_no2_2: rng.gen_range(0.1..0.4),
                temperature: rng.gen_range(19.0..24.0),
                pressure: rng.gen_range(1008.0..1018.0),
                humidity: rng.gen_range(40.0..60.0),
                power: rng.gen_range(4.9..5.2),
                acceleration: [
                    rng.gen_range(-0.05..0.05),
                    rng.gen_range(-0.05..0.05),
                    9.81 + rng.gen_range(-0.05..0.05),
                ],
            }
        }
    }

    /// Secondary particulate sensor with stable mock output.
    #[derive(Default)]
    pub struct MockSecondaryPm;

    #[async_trait]
    impl SecondaryPmSensor for MockSecondaryPm {
        async fn read(&self) -> SecondaryPmReading {
            let mut rng = rand::thread_rng();
            let pm2_5 = rng.gen_range(5.0..9.0);
            SecondaryPmReading {
                pm1: pm2_5 * 0.6,
                pm2_5,
                pm4: pm2_5 * 1.3,
                pm10: pm2_5 * 1.6,
            }
        }
    }

    /// Secondary sensor that never replies.
    pub struct SilentSecondaryPm;

    #[async_trait]
    impl SecondaryPmSensor for SilentSecondaryPm {
        async fn read(&self) -> SecondaryPmReading {
            SecondaryPmReading::NO_REPLY
        }
    }
}
