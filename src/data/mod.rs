pub mod builder;
pub mod covariate;
pub mod event;
pub mod mapping;
pub mod parser;
pub mod schedule;
pub mod structs;
pub use covariate::*;
pub use event::*;
pub use mapping::ColumnMapping;
pub use schedule::{DosingDirective, ScheduleEntry};
pub use structs::{Data, Occasion, Subject};
