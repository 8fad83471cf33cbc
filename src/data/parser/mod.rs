pub mod dataset;

pub use dataset::{read_dataset, read_dataset_from_reader};
