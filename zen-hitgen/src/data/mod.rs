//! Panel preparation and windowing
//!
//! - [`panel`]: long records to a wide, masked panel and back
//! - [`features`]: frequency aliases and Fourier exogenous features
//! - [`scaler`]: per-series scaling fitted on observed cells
//! - [`split`]: persisted train/test split over series ids
//! - [`window`]: the batched, reshuffling window generator

pub mod features;
pub mod panel;
pub mod scaler;
pub mod split;
pub mod window;

pub use features::{fourier_features, Frequency, DEFAULT_FOURIER_ORDER};
pub use panel::{Panel, SeriesRecord, WidePanel};
pub use scaler::{PanelScaler, ScalerKind};
pub use split::SeriesSplit;
pub use window::{detemporalize, DetemporalizeMode, WindowBatch, WindowGenerator};
