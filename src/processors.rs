//! Stock processors, available to the built-in runner and to `rdfc-worker`.
use async_trait::async_trait;
use rdfc_processor::arguments::Arguments;
use rdfc_processor::channel::{Reader, Writer};
use rdfc_processor::error::ProcessorError;
use rdfc_processor::processor::{Processor, ProcessorRegistry};
use strum_macros::{Display, EnumString};
use tracing::{debug, error, info, trace, warn};

pub const SEND: &str = "rdfc:send";
pub const ECHO: &str = "rdfc:echo";
pub const LOG: &str = "rdfc:log";

pub fn register_builtins(registry: &ProcessorRegistry) {
    registry.register(SEND, |args| Ok(Box::new(SendProcessor::try_from(args)?) as Box<dyn Processor>));
    registry.register(ECHO, |args| Ok(Box::new(EchoProcessor::try_from(args)?) as Box<dyn Processor>));
    registry.register(LOG, |args| Ok(Box::new(LogProcessor::try_from(args)?) as Box<dyn Processor>));
}

/// Writes `messages` to `output` in order, then closes it.
pub struct SendProcessor {
    messages: Vec<String>,
    output: Writer,
}

impl TryFrom<Arguments> for SendProcessor {
    type Error = ProcessorError;

    fn try_from(mut args: Arguments) -> Result<Self, Self::Error> {
        Ok(Self {
            messages: args.get_all("messages")?,
            output: args.writer("output")?,
        })
    }
}

#[async_trait]
impl Processor for SendProcessor {
    async fn exec(&mut self) -> anyhow::Result<()> {
        for msg in &self.messages {
            self.output.write(msg.as_bytes()).await?;
        }
        self.output.close().await?;
        Ok(())
    }
}

/// Copies every message from `input` to `output`.
pub struct EchoProcessor {
    input: Reader,
    output: Writer,
}

impl TryFrom<Arguments> for EchoProcessor {
    type Error = ProcessorError;

    fn try_from(mut args: Arguments) -> Result<Self, Self::Error> {
        Ok(Self {
            input: args.reader("input")?,
            output: args.writer("output")?,
        })
    }
}

#[async_trait]
impl Processor for EchoProcessor {
    async fn exec(&mut self) -> anyhow::Result<()> {
        while let Some(msg) = self.input.read().await {
            self.output.write(msg).await?;
        }
        self.output.close().await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

/// Logs every message read from `input`, optionally tagged with `label`.
pub struct LogProcessor {
    input: Reader,
    level: LogLevel,
    label: String,
}

impl TryFrom<Arguments> for LogProcessor {
    type Error = ProcessorError;

    fn try_from(mut args: Arguments) -> Result<Self, Self::Error> {
        let level = match args.get_optional::<String>("level")? {
            None => LogLevel::default(),
            Some(raw) => raw.parse().map_err(|_| ProcessorError::InvalidArgument {
                name: "level".to_string(),
                reason: format!("unknown log level `{raw}`"),
            })?,
        };
        let input = args.reader("input")?;
        let label = args
            .get_optional::<String>("label")?
            .unwrap_or_else(|| input.uri().to_string());
        Ok(Self { input, level, label })
    }
}

#[async_trait]
impl Processor for LogProcessor {
    async fn exec(&mut self) -> anyhow::Result<()> {
        let label = &self.label;
        while let Some(msg) = self.input.read().await {
            let msg = String::from_utf8_lossy(&msg);
            match self.level {
                LogLevel::Trace => trace!(%label, "{msg}"),
                LogLevel::Debug => debug!(%label, "{msg}"),
                LogLevel::Info => info!(%label, "{msg}"),
                LogLevel::Warn => warn!(%label, "{msg}"),
                LogLevel::Error => error!(%label, "{msg}"),
            }
        }
        Ok(())
    }
}
