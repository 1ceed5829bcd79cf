use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{ArgGroup, Parser};
use color_eyre::Result;
use color_eyre::eyre::{WrapErr, bail, ensure, eyre};
use lunaglass::scsi::response::{
    Response, ResponseParser, inquiry_response, no_response, read_capacity_response,
};
use lunaglass::scsi::{CommandBlock, TaskAttribute, command};
use lunaglass::{
    BackingStore, Command, CommandId, CommandRequest, DeliveryError, DeviceConfig, Engine,
    EngineConfig, FileStore, FrontEnd, Outcome, RamdiskStore, ScatterList, Session,
};
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Debug, Parser)]
#[command(name = "lunaglass")]
#[command(about = "Runs a write/read-back pass through the SCSI execution engine", long_about = None)]
#[command(group = ArgGroup::new("backing").args(["file", "ramdisk_blocks"]).required(true))]
struct Args {
    /// Disk image to attach
    #[arg(long, value_name = "PATH")]
    file: Option<PathBuf>,
    /// Attach an in-memory device of this many blocks instead
    #[arg(long, value_name = "BLOCKS")]
    ramdisk_blocks: Option<u64>,
    /// Logical block size (bytes)
    #[arg(long, default_value_t = 512)]
    block_size: u32,
    /// LUN to attach the device at
    #[arg(long, default_value_t = 0)]
    lun: u64,
    /// Largest unit handed to the backing store (blocks)
    #[arg(long)]
    max_transfer_blocks: Option<u32>,
    /// Completion worker tasks
    #[arg(long, default_value_t = 4)]
    workers: usize,
    /// Blocks written and read back
    #[arg(long, default_value_t = 64)]
    blocks: u16,
    /// First block of the pattern
    #[arg(long, default_value_t = 0)]
    lba: u32,
}

/// Delivered results, in delivery order.
struct Delivered {
    id: CommandId,
    outcome: Option<Outcome>,
    data: Option<Vec<u8>>,
}

/// Front end that forwards every result over a channel.
struct ChannelFrontEnd {
    tx: mpsc::UnboundedSender<Delivered>,
}

impl ChannelFrontEnd {
    fn send(&self, command: &Arc<Command>, data: Option<Vec<u8>>) -> Result<(), DeliveryError> {
        self.tx
            .send(Delivered {
                id: command.id(),
                outcome: command.outcome(),
                data,
            })
            .map_err(|_| DeliveryError::Failed("receiver gone".into()))
    }
}

impl FrontEnd for ChannelFrontEnd {
    fn deliver_data(&self, command: &Arc<Command>) -> Result<(), DeliveryError> {
        self.send(command, command.read_data())
    }

    fn deliver_status(&self, command: &Arc<Command>) -> Result<(), DeliveryError> {
        self.send(command, None)
    }

    fn deliver_task_management_response(
        &self,
        command: &Arc<Command>,
    ) -> Result<(), DeliveryError> {
        self.send(command, None)
    }
}

struct Initiator {
    engine: Engine,
    session: Arc<Session>,
    rx: mpsc::UnboundedReceiver<Delivered>,
    lun: u64,
}

impl Initiator {
    async fn run(&mut self, request: CommandRequest) -> Result<Delivered> {
        let command = self.engine.submit(&self.session, request)?;
        let delivered = self
            .rx
            .recv()
            .await
            .ok_or_else(|| eyre!("front end channel closed"))?;
        ensure!(
            delivered.id == command.id(),
            "expected result for command {}, got {}",
            command.id(),
            delivered.id
        );
        match &delivered.outcome {
            Some(Outcome::Good { .. }) => Ok(delivered),
            Some(Outcome::Failed(err)) => bail!("command {} failed: {err}", command.id()),
            other => bail!("command {} ended with {other:?}", command.id()),
        }
    }

    async fn control(
        &mut self,
        name: &str,
        cdb: CommandBlock,
        parse: ResponseParser,
    ) -> Result<Response> {
        let delivered = self.run(CommandRequest::new(self.lun, cdb)).await?;
        let data = delivered.data.unwrap_or_default();
        debug!(command = name, len = data.len(), "control command done");
        parse(&data).wrap_err_with(|| format!("parse {name} response"))
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let store: Arc<dyn BackingStore> = match (&args.file, args.ramdisk_blocks) {
        (Some(path), None) => Arc::new(
            FileStore::open(path, args.block_size)
                .await
                .wrap_err("open file store")?,
        ),
        (None, Some(blocks)) => Arc::new(RamdiskStore::new(args.block_size, blocks)?),
        _ => unreachable!("clap enforces mutually exclusive arguments"),
    };

    let engine = Engine::start(EngineConfig {
        workers: args.workers,
        retry_interval: Duration::from_millis(10),
        ..EngineConfig::default()
    })?;
    let mut device_config = DeviceConfig::named("demo");
    device_config.max_transfer_blocks = args.max_transfer_blocks;
    let device = engine.attach_device(args.lun, store, device_config)?;

    let (tx, rx) = mpsc::unbounded_channel();
    let session = engine.open_session(Arc::new(ChannelFrontEnd { tx }));
    let mut initiator = Initiator {
        engine: engine.clone(),
        session: Arc::clone(&session),
        rx,
        lun: args.lun,
    };

    initiator
        .control("TEST UNIT READY", command::test_unit_ready(), no_response)
        .await?;
    if let Response::Inquiry(inquiry) = initiator
        .control("INQUIRY", command::inquiry(), inquiry_response)
        .await?
    {
        info!(
            vendor = %String::from_utf8_lossy(&inquiry.vendor).trim_end(),
            product = %String::from_utf8_lossy(&inquiry.product).trim_end(),
            "inquiry"
        );
    }
    if let Response::ReadCapacity(capacity) = initiator
        .control("READ CAPACITY", command::read_capacity(), read_capacity_response)
        .await?
    {
        info!(last_lba = capacity.last_lba, block_size = capacity.block_size, "read capacity");
    }

    let len = usize::from(args.blocks) * args.block_size as usize;
    let pattern: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    initiator
        .run(
            CommandRequest::new(args.lun, command::write10(args.lba, args.blocks))
                .data(ScatterList::from_vec(pattern.clone())),
        )
        .await
        .wrap_err("write pattern")?;
    initiator
        .run(
            CommandRequest::new(args.lun, command::synchronize_cache())
                .attribute(TaskAttribute::Ordered),
        )
        .await
        .wrap_err("synchronize cache")?;
    let read = initiator
        .run(CommandRequest::new(args.lun, command::read10(args.lba, args.blocks)))
        .await
        .wrap_err("read back")?;
    if read.data.as_deref() != Some(pattern.as_slice()) {
        bail!("read back data does not match what was written");
    }
    info!(bytes = len, "pattern verified");

    let stats = device.stats().snapshot();
    println!(
        "lun {}: {} commands, {} failed, {} aborted, {} bytes read, {} bytes written",
        device.lun(),
        stats.completed,
        stats.failed,
        stats.aborted,
        stats.read_bytes,
        stats.write_bytes
    );

    engine.shutdown().await;
    Ok(())
}
