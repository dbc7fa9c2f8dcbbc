//! dynheap - per-frame GPU upload heap workload driver
//!
//! This application builds the shared page and slot pools on a device, then runs a
//! number of rendering contexts against them frame after frame while a simulated GPU
//! retires fences. Pool statistics are reported at teardown.

mod sim;

use crate::sim::{SimConfig, WorkloadConfig, run_simulation};

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use dynheap::{
    ChunkManager, ChunkManagerConfig, Device, DynamicMemoryManager, HostDevice, PoolStats,
    SlotGroupSpec, SlotPoolManager,
};
use nix::sys::mman::{MlockAllFlags, mlockall};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Device the pools create their chunks on
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DeviceKind {
    /// System memory standing in for an upload heap
    Host,
    /// OpenCL GPU (requires the `opencl` feature)
    Opencl,
}

/// Command line arguments for the workload driver
#[derive(Parser, Debug)]
#[clap(
    name = "dynheap",
    about = "Drive per-frame GPU upload allocations through a fence-gated shared chunk pool.",
    version
)]
struct Args {
    /// Device to allocate chunks on
    #[clap(long, value_enum, default_value = "host")]
    device_kind: DeviceKind,

    /// Nominal page size (e.g., 64K, 1M). Plain numbers are bytes.
    #[clap(long, value_parser = parse_size_string, default_value = "64K")]
    page_size: u64,

    /// Pages created up front
    #[clap(long, default_value = "4")]
    reserve_pages: usize,

    /// Byte budget of the host device (e.g., 16M); unlimited if not set
    #[clap(long, value_parser = parse_size_string)]
    budget: Option<u64>,

    /// Number of concurrent rendering contexts
    #[clap(short, long, default_value = "4")]
    contexts: usize,

    /// Frames to run; 0 runs until Ctrl-C
    #[clap(short, long, default_value = "600")]
    frames: u64,

    /// Frames the GPU may lag behind before the CPU waits
    #[clap(long, default_value = "3")]
    frames_in_flight: u64,

    /// Simulated GPU time per frame in milliseconds
    #[clap(long, default_value = "8")]
    gpu_latency_ms: u64,

    /// Upload allocations per context per frame
    #[clap(long, default_value = "64")]
    allocations_per_frame: usize,

    /// Smallest upload allocation (e.g., 256)
    #[clap(long, value_parser = parse_size_string, default_value = "256")]
    min_allocation: u64,

    /// Largest upload allocation (e.g., 16K)
    #[clap(long, value_parser = parse_size_string, default_value = "16K")]
    max_allocation: u64,

    /// Slots per slot group; 0 disables the slot pool
    #[clap(long, default_value = "256")]
    slots_per_group: u32,

    /// Slots taken per context per frame
    #[clap(long, default_value = "32")]
    slots_per_frame: usize,

    /// Stale queue depth that triggers a warning
    #[clap(long, default_value = "1024")]
    stale_warning: usize,

    /// GPU device index to use (0 for first GPU, OpenCL only)
    #[clap(short, long, default_value = "0")]
    device: usize,

    /// OpenCL platform index
    #[clap(short, long, default_value = "0")]
    platform: usize,

    /// Lock process memory with mlockall
    #[clap(long)]
    lock_memory: bool,

    /// Enable verbose logging
    #[clap(short, long)]
    verbose: bool,

    /// List available OpenCL platforms and devices and exit
    #[clap(long)]
    list_devices: bool,
}

/// Parses a size string (e.g., "256", "64K", "2M", "1G") into bytes.
pub(crate) fn parse_size_string(size_str: &str) -> Result<u64> {
    let size_str = size_str.trim().to_uppercase();
    let (num_part, suffix) = size_str.split_at(
        size_str
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(size_str.len()),
    );

    let num: u64 = num_part.parse().context("Invalid size number")?;

    let multiplier: u64 = match suffix {
        "" | "B" => 1,
        "K" | "KB" => 1024,
        "M" | "MB" => 1024 * 1024,
        "G" | "GB" => 1024 * 1024 * 1024,
        _ => bail!("Invalid size suffix: '{}'. Use B, K/KB, M/MB or G/GB.", suffix),
    };
    num.checked_mul(multiplier)
        .with_context(|| format!("Size '{}' overflows", size_str))
}

/// Lists available OpenCL devices.
#[cfg(feature = "opencl")]
fn list_opencl_devices() -> Result<()> {
    use opencl3::{
        device::{CL_DEVICE_TYPE_GPU, Device as ClDevice, get_device_ids},
        platform::get_platforms,
    };

    println!("Available OpenCL Platforms and Devices:");
    let platforms = get_platforms().context("Failed to get OpenCL platforms")?;
    if platforms.is_empty() {
        println!("  No OpenCL platforms found.");
        return Ok(());
    }

    for (plat_idx, platform) in platforms.iter().enumerate() {
        let plat_name = platform
            .name()
            .unwrap_or_else(|_| "Unknown Platform".to_string());
        println!("\nPlatform {}: {}", plat_idx, plat_name);

        match get_device_ids(platform.id(), CL_DEVICE_TYPE_GPU) {
            Ok(device_ids) if device_ids.is_empty() => {
                println!("  No GPU devices found on this platform.");
            }
            Ok(device_ids) => {
                for (dev_idx, device_id) in device_ids.iter().enumerate() {
                    let device = ClDevice::new(*device_id);
                    let dev_name = device
                        .name()
                        .unwrap_or_else(|_| "Unknown Device".to_string());
                    let max_alloc = device.max_mem_alloc_size().unwrap_or(0);
                    println!(
                        "  Device {}: {} - Max allocation: {} MB",
                        dev_idx,
                        dev_name,
                        max_alloc / (1024 * 1024)
                    );
                }
            }
            Err(e) => {
                println!("  Error getting devices for this platform: {}", e);
            }
        }
    }
    Ok(())
}

#[cfg(not(feature = "opencl"))]
fn list_opencl_devices() -> Result<()> {
    bail!("dynheap was built without the `opencl` feature")
}

/// Builds the pools on `device`, runs the workload and tears everything down.
async fn run<D: Device>(device: D, args: &Args, slots_supported: bool) -> Result<()> {
    let device = Arc::new(device);

    let page_pool = Arc::new(
        ChunkManager::for_pages(
            device.clone(),
            ChunkManagerConfig {
                name: "dynamic memory manager".to_string(),
                reserve_chunks: args.reserve_pages,
                reserve_size: args.page_size,
                stale_warning_threshold: Some(args.stale_warning),
            },
        )
        .context("Failed to reserve upload pages")?,
    );

    let slot_pool = if slots_supported && args.slots_per_group > 0 {
        Some(Arc::new(
            ChunkManager::for_slot_groups(
                device.clone(),
                SlotGroupSpec {
                    name: "dynamic slot group".to_string(),
                    slots_per_group: args.slots_per_group,
                },
                ChunkManagerConfig {
                    name: "slot pool manager".to_string(),
                    stale_warning_threshold: Some(args.stale_warning),
                    ..Default::default()
                },
            )
            .context("Failed to create slot pool")?,
        ))
    } else {
        None
    };

    let config = SimConfig {
        contexts: args.contexts,
        frames: (args.frames > 0).then_some(args.frames),
        frames_in_flight: args.frames_in_flight,
        gpu_latency: Duration::from_millis(args.gpu_latency_ms),
        page_size: args.page_size,
        workload: WorkloadConfig {
            allocations_per_frame: args.allocations_per_frame,
            min_allocation: args.min_allocation,
            max_allocation: args.max_allocation,
            slots_per_frame: args.slots_per_frame,
        },
    };

    let cancel = CancellationToken::new();
    {
        let token = cancel.clone();
        tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                log::info!("Ctrl-C received, finishing current frame.");
                token.cancel();
            }
        });
    }

    let report = run_simulation(page_pool.clone(), slot_pool.clone(), &config, cancel).await?;

    log::info!(
        "Ran {} frame(s): {} bytes and {} slots allocated, {} failed allocation(s)",
        report.frames,
        report.bytes_allocated,
        report.slots_allocated,
        report.failed_allocations
    );

    let stats = teardown(&page_pool, slot_pool.as_deref(), report.last_completed_fence)?;
    println!(
        "{} page(s) created, {} bytes total, peak stale queue depth {}",
        stats.chunks_created, stats.created_size, stats.peak_stale_chunks
    );
    Ok(())
}

/// Destroys both pools, attempting each even if the other fails.
fn teardown<D: Device>(
    page_pool: &DynamicMemoryManager<D>,
    slot_pool: Option<&SlotPoolManager<D>>,
    last_completed_fence: u64,
) -> Result<PoolStats> {
    let slots = slot_pool.map(|pool| pool.destroy(last_completed_fence));
    let pages = page_pool.destroy(last_completed_fence);

    if let Some(Err(e)) = &slots {
        log::error!("Slot pool teardown failed: {}", e);
    }
    let stats = pages.context("Failed to destroy page pool")?;
    slots
        .transpose()
        .context("Failed to destroy slot pool")?;
    Ok(stats)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.list_devices {
        return list_opencl_devices();
    }

    if args.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    if args.min_allocation == 0 || args.min_allocation > args.max_allocation {
        bail!(
            "Invalid allocation range {}..={}",
            args.min_allocation,
            args.max_allocation
        );
    }
    if args.page_size == 0 {
        bail!("Page size must be non-zero");
    }

    log::info!("Starting dynamic heap workload");

    if args.lock_memory {
        log::info!("Attempting to lock process memory using mlockall()...");
        match mlockall(MlockAllFlags::MCL_CURRENT | MlockAllFlags::MCL_FUTURE) {
            Ok(_) => log::info!("Successfully locked process memory."),
            Err(e) => {
                log::warn!(
                    "Failed to lock process memory (requires root or CAP_IPC_LOCK): {}",
                    e
                );
            }
        }
    }

    match args.device_kind {
        DeviceKind::Host => {
            let device = match args.budget {
                Some(budget) => HostDevice::with_budget("host", budget),
                None => HostDevice::new("host"),
            };
            run(device, &args, true).await?;
        }
        #[cfg(feature = "opencl")]
        DeviceKind::Opencl => {
            use dynheap::opencl::{OpenClDevice, OpenClDeviceConfig};

            let device = OpenClDevice::new(&OpenClDeviceConfig {
                device_index: args.device,
                platform_index: args.platform,
            })
            .context("Failed to initialize OpenCL device")?;
            log::info!("Slot groups are not available on OpenCL; slot pool disabled");
            run(device, &args, false).await?;
        }
        #[cfg(not(feature = "opencl"))]
        DeviceKind::Opencl => {
            bail!(
                "dynheap was built without the `opencl` feature (device {}, platform {})",
                args.device,
                args.platform
            );
        }
    }

    log::info!("Dynamic heap workload has shut down.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size_string() {
        assert_eq!(parse_size_string("256").unwrap(), 256);
        assert_eq!(parse_size_string("64K").unwrap(), 64 * 1024);
        assert_eq!(parse_size_string(" 2mb ").unwrap(), 2 * 1024 * 1024);
        assert_eq!(parse_size_string("1G").unwrap(), 1024 * 1024 * 1024);
        assert!(parse_size_string("12T").is_err());
        assert!(parse_size_string("K").is_err());
    }

    #[test]
    fn test_teardown_destroys_pages_when_slot_pool_fails() {
        let device = Arc::new(HostDevice::new("host"));
        let page_pool =
            ChunkManager::for_pages(device.clone(), ChunkManagerConfig::default()).unwrap();
        let slot_pool = ChunkManager::for_slot_groups(
            device.clone(),
            SlotGroupSpec::default(),
            ChunkManagerConfig::default(),
        )
        .unwrap();

        let page = page_pool.allocate_chunk(4096).unwrap();
        page_pool.discard_chunks([page], 1);
        let held = slot_pool.allocate_chunk(1).unwrap();

        let err = teardown(&page_pool, Some(&slot_pool), 1).unwrap_err();
        assert!(format!("{:#}", err).contains("slot pool"));
        assert!(page_pool.allocate_chunk(1).is_err());

        drop(held);
        drop(slot_pool);
        drop(page_pool);
        assert_eq!(device.allocated_bytes(), 0);
    }

    #[test]
    fn test_args_parse_defaults() {
        let args = Args::parse_from(["dynheap", "--page-size", "128K", "-c", "2"]);
        assert_eq!(args.page_size, 128 * 1024);
        assert_eq!(args.contexts, 2);
        assert_eq!(args.device_kind, DeviceKind::Host);
        assert_eq!(args.max_allocation, 16 * 1024);
        assert!(args.budget.is_none());
    }
}
