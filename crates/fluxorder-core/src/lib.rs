pub mod apply;
pub mod config;
pub mod declaration;
pub mod engine;
pub mod error;
pub mod graph;
pub mod image;
pub mod io;
pub mod paths;
pub mod render;
pub mod resource;
pub mod source;
pub mod status;
pub mod store;
pub mod unit;


pub use engine::{Engine, EngineSettings, LoadReport, TickReport};
pub use error::{FluxError, Result};
pub use status::{Health, StatusSnapshot};
pub use unit::{Trigger, UnitStatus};
