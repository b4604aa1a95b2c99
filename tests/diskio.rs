#![cfg(feature = "write")]
//! End-to-end tests of the flash backend and the dispatch table over a
//! simulated NOR device.
//!
//! The simulator honors the physical rules that matter: programming
//! only clears bits (data is AND-ed in), erasing a block is required
//! before it can hold new data, and every program/erase leaves the
//! status register busy for a few polls. DMA completions are signaled
//! through the same transfer flag the interrupt handler would use.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use diskio::config::{BLOCK_SIZE, PAGE_SIZE, SECTOR_SIZE};
use diskio::hal::{Clock, SpiTransport};
use diskio::{
    BlockDisk, DiskError, DiskManager, DiskResult, DiskStatus, FlushPolicy, IoctlCmd, IoctlReq,
    SpiFlashDisk, TransferFlag,
};

/// Every time query advances the fake clock one millisecond, so
/// bounded waits run out without real sleeping.
struct TickClock(AtomicU64);

impl TickClock {
    fn new() -> Self {
        Self(AtomicU64::new(0))
    }
}

impl Clock for TickClock {
    fn now_ms(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
    fn delay_ms(&self, ms: u64) {
        self.0.fetch_add(ms, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ev {
    Erase(u32),
    Program(u32),
    DmaRead { addr: u32, len: usize },
}

struct SimState {
    mem: Vec<u8>,
    id: [u8; 3],
    signal: Option<Arc<TransferFlag>>,
    frame: Vec<u8>,
    write_enabled: bool,
    pending_program: Option<u32>,
    read_cursor: usize,
    /// Status polls left before busy clears.
    busy: u32,
    stuck_busy: bool,
    /// Status register reads busy until a reset command arrives.
    busy_until_reset: bool,
    mute_dma: bool,
    /// Signal the error path instead of completion, as the transfer
    /// error interrupt would.
    fail_dma: bool,
    corrupt_program: bool,
    events: Vec<Ev>,
}

/// Handle shared between the disk (as its transport) and the test (for
/// fault injection and event assertions).
#[derive(Clone)]
struct FlashSim(Arc<Mutex<SimState>>);

const CMD_WRITE_ENABLE: u8 = 0x06;
const CMD_READ_STATUS: u8 = 0x05;
const CMD_FAST_READ: u8 = 0x0B;
const CMD_PAGE_PROGRAM: u8 = 0x02;
const CMD_SECTOR_ERASE: u8 = 0x20;
const CMD_CHIP_ERASE: u8 = 0xC7;
const CMD_READ_ID: u8 = 0x9F;
const CMD_RESET: u8 = 0x99;

fn addr24(frame: &[u8]) -> u32 {
    (u32::from(frame[1]) << 16) | (u32::from(frame[2]) << 8) | u32::from(frame[3])
}

impl FlashSim {
    /// Fresh fully-erased Winbond-identifying part.
    fn new(size: usize) -> Self {
        Self(Arc::new(Mutex::new(SimState {
            mem: vec![0xFF; size],
            id: [0xEF, 0x40, 0x15], // 2 MiB
            signal: None,
            frame: Vec::new(),
            write_enabled: false,
            pending_program: None,
            read_cursor: 0,
            busy: 0,
            stuck_busy: false,
            busy_until_reset: false,
            mute_dma: false,
            fail_dma: false,
            corrupt_program: false,
            events: Vec::new(),
        })))
    }

    fn attach(&self, signal: Arc<TransferFlag>) {
        self.0.lock().unwrap().signal = Some(signal);
    }

    fn set<F: FnOnce(&mut SimState)>(&self, f: F) {
        f(&mut self.0.lock().unwrap());
    }

    fn events(&self) -> Vec<Ev> {
        self.0.lock().unwrap().events.clone()
    }

    fn erase_count(&self, block: u32) -> usize {
        self.events()
            .iter()
            .filter(|e| **e == Ev::Erase(block))
            .count()
    }

    fn program_page_count(&self, block: u32) -> usize {
        let base = block * BLOCK_SIZE as u32;
        self.events()
            .iter()
            .filter(|e| matches!(e, Ev::Program(a) if (base..base + BLOCK_SIZE as u32).contains(a)))
            .count()
    }

    /// Whole-block cache loads observed (direct sector reads and
    /// verify readbacks have different lengths).
    fn block_loads(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, Ev::DmaRead { len, .. } if *len == BLOCK_SIZE))
            .count()
    }
}

impl SimState {
    fn status_byte(&mut self) -> u8 {
        if self.stuck_busy || self.busy_until_reset {
            return 0x01;
        }
        if self.busy > 0 {
            self.busy -= 1;
            return 0x01;
        }
        0x00
    }

    fn signal_dma(&self) {
        if self.mute_dma {
            return;
        }
        if let Some(signal) = &self.signal {
            if self.fail_dma {
                signal.fail();
            } else {
                signal.complete();
            }
        }
    }
}

impl SpiTransport for FlashSim {
    fn chip_select(&mut self, active: bool) {
        let mut s = self.0.lock().unwrap();
        if active {
            s.frame.clear();
            s.pending_program = None;
        }
    }

    fn transmit(&mut self, bytes: &[u8]) -> DiskResult<()> {
        let mut s = self.0.lock().unwrap();
        s.frame.extend_from_slice(bytes);
        match s.frame[0] {
            CMD_WRITE_ENABLE => s.write_enabled = true,
            CMD_FAST_READ if s.frame.len() >= 5 => s.read_cursor = addr24(&s.frame) as usize,
            CMD_PAGE_PROGRAM if s.frame.len() >= 4 => {
                assert!(s.write_enabled, "page program without write enable");
                s.pending_program = Some(addr24(&s.frame));
            }
            CMD_SECTOR_ERASE if s.frame.len() >= 4 => {
                assert!(s.write_enabled, "erase without write enable");
                let addr = addr24(&s.frame) as usize;
                let block = (addr / BLOCK_SIZE) as u32;
                let base = block as usize * BLOCK_SIZE;
                s.mem[base..base + BLOCK_SIZE].fill(0xFF);
                s.events.push(Ev::Erase(block));
                s.write_enabled = false;
                s.busy = 3;
            }
            CMD_CHIP_ERASE => {
                assert!(s.write_enabled, "chip erase without write enable");
                s.mem.fill(0xFF);
                s.write_enabled = false;
                s.busy = 3;
            }
            CMD_RESET => s.busy_until_reset = false,
            _ => {}
        }
        Ok(())
    }

    fn exchange(&mut self, frame: &mut [u8]) -> DiskResult<()> {
        let mut s = self.0.lock().unwrap();
        match frame[0] {
            CMD_READ_ID => frame[1..4].copy_from_slice(&s.id),
            CMD_READ_STATUS => frame[1] = s.status_byte(),
            _ => {}
        }
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8]) -> DiskResult<()> {
        let mut s = self.0.lock().unwrap();
        let status = s.status_byte();
        buf.fill(status);
        Ok(())
    }

    fn receive_dma(&mut self, buf: &mut [u8]) -> DiskResult<()> {
        let mut s = self.0.lock().unwrap();
        let start = s.read_cursor;
        let end = start + buf.len();
        buf.copy_from_slice(&s.mem[start..end]);
        s.read_cursor = end;
        s.events.push(Ev::DmaRead {
            addr: start as u32,
            len: buf.len(),
        });
        s.signal_dma();
        Ok(())
    }

    fn transmit_dma(&mut self, bytes: &[u8]) -> DiskResult<()> {
        let mut s = self.0.lock().unwrap();
        let addr = s.pending_program.expect("data without page program") as usize;
        for (i, b) in bytes.iter().enumerate() {
            // NOR programming can only clear bits.
            s.mem[addr + i] &= *b;
        }
        if s.corrupt_program {
            s.mem[addr] ^= 0x01;
        }
        s.events.push(Ev::Program(addr as u32));
        s.write_enabled = false;
        s.busy = 3;
        s.signal_dma();
        Ok(())
    }
}

fn make_flash(sim: &FlashSim, clock: Arc<TickClock>) -> SpiFlashDisk<FlashSim> {
    let disk = SpiFlashDisk::new(sim.clone(), clock);
    sim.attach(disk.completion());
    disk
}

fn ready_flash(sim: &FlashSim) -> SpiFlashDisk<FlashSim> {
    let disk = make_flash(sim, Arc::new(TickClock::new()));
    assert!(disk.initialize().is_ready());
    disk
}

fn sector_of(byte: u8) -> Vec<u8> {
    vec![byte; SECTOR_SIZE]
}

#[test]
fn identify_derives_capacity_and_sector_count() {
    let sim = FlashSim::new(2 * 1024 * 1024);
    let disk = ready_flash(&sim);
    let mut req = IoctlReq::SectorCount(0);
    disk.ioctl(&mut req).unwrap();
    assert_eq!(req, IoctlReq::SectorCount(4096));
    let mut req = IoctlReq::BlockSize(0);
    disk.ioctl(&mut req).unwrap();
    assert_eq!(req, IoctlReq::BlockSize(8));
}

#[test]
fn unknown_identity_stays_uninitialized() {
    let sim = FlashSim::new(1024 * 1024);
    sim.set(|s| s.id = [0x00, 0x00, 0x00]);
    let disk = make_flash(&sim, Arc::new(TickClock::new()));
    assert!(disk.initialize().contains(DiskStatus::NOINIT));
    let mut buf = sector_of(0);
    assert_eq!(disk.read(&mut buf, 0, 1), Err(DiskError::NotReady));
}

#[test]
fn busy_device_is_reset_during_bring_up() {
    let sim = FlashSim::new(1024 * 1024);
    sim.set(|s| s.busy_until_reset = true);
    let disk = make_flash(&sim, Arc::new(TickClock::new()));
    assert!(disk.initialize().is_ready());
    assert!(!sim.0.lock().unwrap().busy_until_reset);
}

/// Scenario A: two dirty sectors in one block, an untouched neighbor
/// keeps its erased content.
#[test]
fn writes_within_a_block_coalesce_and_neighbors_survive() {
    let sim = FlashSim::new(1024 * 1024);
    let disk = ready_flash(&sim);

    disk.write(&sector_of(0xAA), 3, 1).unwrap();
    disk.write(&sector_of(0xBB), 7, 1).unwrap();

    let mut buf = sector_of(0);
    disk.read(&mut buf, 3, 1).unwrap();
    assert!(buf.iter().all(|&b| b == 0xAA));
    disk.read(&mut buf, 5, 1).unwrap();
    assert!(buf.iter().all(|&b| b == 0xFF));
    disk.read(&mut buf, 7, 1).unwrap();
    assert!(buf.iter().all(|&b| b == 0xBB));

    // The shadow stays resident across the flush between the two
    // write calls, so block 0 was loaded exactly once.
    assert_eq!(sim.block_loads(), 1);
}

/// P3: a multi-sector run inside one block costs one erase and one
/// program sequence.
#[test]
fn one_block_run_is_one_erase_one_program_sequence() {
    let sim = FlashSim::new(1024 * 1024);
    let disk = ready_flash(&sim);

    let mut run = Vec::new();
    for i in 0..8u8 {
        run.extend_from_slice(&sector_of(i));
    }
    disk.write(&run, 0, 8).unwrap();

    assert_eq!(sim.erase_count(0), 1);
    assert_eq!(sim.program_page_count(0), BLOCK_SIZE / PAGE_SIZE);
}

/// P4: rewriting identical content is free.
#[test]
fn unchanged_rewrite_causes_no_erase() {
    let sim = FlashSim::new(1024 * 1024);
    let disk = ready_flash(&sim);

    disk.write(&sector_of(0xC3), 9, 1).unwrap();
    let erases = sim.erase_count(1);
    disk.write(&sector_of(0xC3), 9, 1).unwrap();
    assert_eq!(sim.erase_count(1), erases);
}

/// Scenario B: a write to block 0 followed by a read in another block;
/// the flush lands exactly once, before the other block's data moves.
#[test]
fn cross_block_read_after_write_sees_one_flush_first() {
    let sim = FlashSim::new(1024 * 1024);
    let disk = ready_flash(&sim);

    disk.write(&sector_of(0x11), 3, 1).unwrap();
    let mut buf = sector_of(0);
    disk.read(&mut buf, 520, 1).unwrap();
    assert!(buf.iter().all(|&b| b == 0xFF));

    assert_eq!(sim.erase_count(0), 1);
    let events = sim.events();
    let flush_pos = events
        .iter()
        .position(|e| *e == Ev::Erase(0))
        .expect("no flush observed");
    let far_read_pos = events
        .iter()
        .position(|e| matches!(e, Ev::DmaRead { addr, .. } if *addr == 520 * SECTOR_SIZE as u32))
        .expect("no direct read observed");
    assert!(flush_pos < far_read_pos);
}

/// Same ordering under the deferred policy, where the flush is forced
/// by the cross-block read instead of the write itself.
#[test]
fn deferred_policy_flushes_on_cross_block_read() {
    let sim = FlashSim::new(1024 * 1024);
    let clock = Arc::new(TickClock::new());
    let disk = make_flash(&sim, clock)
        .with_flush_policy(FlushPolicy::Deferred { quiet_ms: 1_000_000 });
    assert!(disk.initialize().is_ready());

    disk.write(&sector_of(0x11), 3, 1).unwrap();
    assert_eq!(sim.erase_count(0), 0);

    let mut buf = sector_of(0);
    disk.read(&mut buf, 520, 1).unwrap();
    assert_eq!(sim.erase_count(0), 1);
    assert_eq!(sim.program_page_count(0), BLOCK_SIZE / PAGE_SIZE);
}

#[test]
fn deferred_policy_flushes_after_quiet_period() {
    let sim = FlashSim::new(1024 * 1024);
    let clock = Arc::new(TickClock::new());
    let disk = make_flash(&sim, clock.clone())
        .with_flush_policy(FlushPolicy::Deferred { quiet_ms: 5_000 });
    assert!(disk.initialize().is_ready());

    disk.write(&sector_of(0x22), 0, 1).unwrap();
    assert_eq!(sim.erase_count(0), 0);

    clock.delay_ms(10_000);
    // Any backend entry past the deadline performs the flush.
    assert!(disk.status().is_ready());
    assert_eq!(sim.erase_count(0), 1);
}

#[test]
fn sync_ioctl_flushes_pending_writes() {
    let sim = FlashSim::new(1024 * 1024);
    let clock = Arc::new(TickClock::new());
    let disk = make_flash(&sim, clock)
        .with_flush_policy(FlushPolicy::Deferred { quiet_ms: 1_000_000 });
    assert!(disk.initialize().is_ready());

    disk.write(&sector_of(0x33), 2, 1).unwrap();
    assert_eq!(sim.erase_count(0), 0);
    disk.ioctl(&mut IoctlReq::Sync).unwrap();
    assert_eq!(sim.erase_count(0), 1);
}

/// P6: corrupted programming is caught by the readback compare and
/// reported as a verify failure, not success.
#[test]
fn verify_detects_corrupted_program() {
    let sim = FlashSim::new(1024 * 1024);
    let disk = ready_flash(&sim);
    sim.set(|s| s.corrupt_program = true);
    assert_eq!(
        disk.write(&sector_of(0x44), 0, 1),
        Err(DiskError::VerifyMismatch)
    );
}

/// Scenario C / P5: a transport that never signals completion makes
/// the call fail with a timeout, and the device remains usable.
#[test]
fn missing_dma_completion_times_out_and_recovers() {
    let sim = FlashSim::new(1024 * 1024);
    let clock = Arc::new(TickClock::new());
    let disk = make_flash(&sim, clock).with_timeout(2_000);
    assert!(disk.initialize().is_ready());

    sim.set(|s| s.mute_dma = true);
    let mut buf = sector_of(0);
    assert_eq!(disk.read(&mut buf, 0, 1), Err(DiskError::Timeout));

    sim.set(|s| s.mute_dma = false);
    disk.read(&mut buf, 0, 1).unwrap();
}

#[test]
fn stuck_busy_after_program_is_a_fatal_timeout() {
    let sim = FlashSim::new(1024 * 1024);
    let disk = ready_flash(&sim);
    sim.set(|s| s.stuck_busy = true);
    assert_eq!(
        disk.write(&sector_of(0x55), 0, 1),
        Err(DiskError::Timeout)
    );
}

#[test]
fn reported_transfer_error_is_not_a_timeout() {
    let sim = FlashSim::new(1024 * 1024);
    let disk = ready_flash(&sim);
    // The error interrupt signals the flag too, so the waiter returns
    // right away with a transport error instead of running out the
    // timeout.
    sim.set(|s| s.fail_dma = true);
    let mut buf = sector_of(0);
    assert_eq!(disk.read(&mut buf, 0, 1), Err(DiskError::Transport));

    sim.set(|s| s.fail_dma = false);
    disk.read(&mut buf, 0, 1).unwrap();
}

#[test]
fn sector_erase_ioctl_erases_and_invalidates() {
    let sim = FlashSim::new(1024 * 1024);
    let disk = ready_flash(&sim);

    disk.write(&sector_of(0x66), 0, 1).unwrap();
    disk.ioctl(&mut IoctlReq::SectorErase(0)).unwrap();

    let mut buf = sector_of(0);
    disk.read(&mut buf, 0, 1).unwrap();
    assert!(buf.iter().all(|&b| b == 0xFF));
}

#[test]
fn whole_device_erase_clears_everything() {
    let sim = FlashSim::new(1024 * 1024);
    let disk = ready_flash(&sim);

    disk.write(&sector_of(0x77), 100, 1).unwrap();
    disk.ioctl(&mut IoctlReq::DiskErase).unwrap();

    let mut buf = sector_of(0);
    disk.read(&mut buf, 100, 1).unwrap();
    assert!(buf.iter().all(|&b| b == 0xFF));
}

#[test]
fn runs_spanning_blocks_land_on_both_sides() {
    let sim = FlashSim::new(1024 * 1024);
    let disk = ready_flash(&sim);

    // Sectors 6..10 cross the block 0 / block 1 boundary.
    let mut run = Vec::new();
    for i in 0..4u8 {
        run.extend_from_slice(&sector_of(0xD0 + i));
    }
    disk.write(&run, 6, 4).unwrap();

    let mut back = vec![0u8; 4 * SECTOR_SIZE];
    disk.read(&mut back, 6, 4).unwrap();
    assert_eq!(back, run);
    assert_eq!(sim.erase_count(0), 1);
    assert_eq!(sim.erase_count(1), 1);
}

#[test]
fn dispatch_table_routes_and_marshals() {
    let sim = FlashSim::new(1024 * 1024);
    let disk = ready_flash(&sim);

    let mut mgr = DiskManager::new();
    mgr.register(0, Arc::new(disk)).unwrap();
    assert!(mgr.initialize(0).is_ready());

    mgr.write(0, &sector_of(0x88), 12, 1).unwrap();
    let mut buf = sector_of(0);
    mgr.read(0, &mut buf, 12, 1).unwrap();
    assert!(buf.iter().all(|&b| b == 0x88));

    let mut out = [0u8; 4];
    mgr.ioctl_raw(0, IoctlCmd::GetSectorCount as u8, &mut out)
        .unwrap();
    assert_eq!(u32::from_ne_bytes(out), 4096);

    // Erase block 1 through the raw interface (index goes in the
    // buffer, like the filesystem library passes it).
    let mut arg = 1u32.to_ne_bytes();
    mgr.ioctl_raw(0, IoctlCmd::SectorErase as u8, &mut arg)
        .unwrap();
    mgr.read(0, &mut buf, 12, 1).unwrap();
    assert!(buf.iter().all(|&b| b == 0xFF));
}
