//! Real-time voice echo: capture from an input device, run a feedback delay
//! over every sample, play the result on an output device.
//!
//! [`EngineController`] owns the session lifecycle. The devices behind it are
//! pluggable through [`devices::DeviceBackend`]: [`devices::CpalBackend`]
//! for real hardware, [`devices::MockBackend`] for tests.

pub mod config;
pub mod devices;
pub mod dsp;
pub mod engine;
pub mod error;
pub mod params;

pub use config::EngineConfig;
pub use engine::{EngineController, EngineState, SessionStats};
pub use error::{DeviceError, DeviceRole, SessionExit};
pub use params::{EffectParameters, ParamSnapshot};
