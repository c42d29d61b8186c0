pub mod csv_parser;

pub use csv_parser::{load_file, load_reader, LoaderConvention};
