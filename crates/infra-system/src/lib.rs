// Mergeflow Infrastructure - System Adapters
// Implements: OutputStore (filesystem), Converter (delimited reader, external process)

pub mod delimited_converter;
pub mod output_store;
pub mod registry;
pub mod subprocess_converter;

pub use delimited_converter::DelimitedConverter;
pub use output_store::FsOutputStore;
pub use registry::ConverterRegistry;
pub use subprocess_converter::SubprocessConverter;
