pub mod arguments;
pub mod channel;
pub mod error;
pub mod ir;
pub mod jsonrpc;
pub mod message;
pub mod processor;
pub mod runtime;
pub mod window;

pub use arguments::{ArgumentValue, Arguments, ChannelBinder};
pub use channel::{ChannelSink, Reader, Writer};
pub use error::{ChannelError, IRError, ProcessorError};
pub use processor::{Processor, ProcessorFactory, ProcessorRegistry};
