//! MU5 Emulator - CLI Entry Point
//!
//! Commands:
//! - `mu5-emu run <image>` - Run a raw core image
//! - `mu5-emu test` - Run the built-in self-test

use clap::{Parser, Subcommand};

use mu5::cpu::{MS_EXEC, MS_INH_PROG_FAULT};
use mu5::{Cpu, StepEvent, Store, INTERRUPT_NONE};

#[derive(Parser)]
#[command(name = "mu5-emu")]
#[command(author = "Yigit")]
#[command(version = "0.1.0")]
#[command(about = "An instruction-level emulator of the MU5 mainframe central processor")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a raw core image until it spins or the order budget runs out
    Run {
        /// Path to the binary core image
        image: String,
        /// Byte address the image is loaded at
        #[arg(short, long, default_value = "4096")]
        origin: u32,
        /// Initial CO (defaults to the load origin)
        #[arg(short, long)]
        entry: Option<u32>,
        /// Maximum number of orders to execute
        #[arg(short, long, default_value = "10000")]
        max_orders: u64,
        /// Start in executive mode
        #[arg(short = 'x', long)]
        executive: bool,
        /// Show trace output
        #[arg(short, long)]
        trace: bool,
        /// Dump the final register file as JSON
        #[arg(short, long)]
        json: bool,
    },
    /// Run the built-in self-test
    Test,
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Run {
            image,
            origin,
            entry,
            max_orders,
            executive,
            trace,
            json,
        }) => {
            run_image(&image, origin, entry, max_orders, executive, trace, json);
        }
        Some(Commands::Test) => {
            run_self_test();
        }
        None => {
            println!("MU5 Emulator v0.1.0");
            println!("An instruction-level emulator of the MU5 mainframe processor");
            println!();
            println!("Use --help for available commands");
            println!();
            demo_order_pipeline();
        }
    }
}

fn run_image(
    path: &str,
    origin: u32,
    entry: Option<u32>,
    max_orders: u64,
    executive: bool,
    trace: bool,
    json: bool,
) {
    println!("🔧 Running: {}", path);

    let image = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("❌ Failed to read image: {}", e);
            std::process::exit(1);
        }
    };

    let mut cpu = Cpu::new();
    cpu.store.load_image(origin, &image);
    println!("📂 Loaded {} bytes at {:#010x}", image.len(), origin);

    cpu.regs.co = entry.unwrap_or(origin);
    if executive {
        cpu.regs.ms = MS_EXEC;
    }

    println!();
    println!("━━━ Execution ━━━");

    let mut orders = 0u64;
    while orders < max_orders {
        let co = cpu.regs.co;
        match cpu.execute_next_order() {
            StepEvent::Executed(order) => {
                if trace {
                    println!("{:#010x}: {}", co, order);
                }
                orders += 1;
                // A retired jump back onto itself with nothing pending is
                // the machine's idle loop; stop there.
                if cpu.regs.co == co && cpu.get_interrupt_number() == INTERRUPT_NONE {
                    println!("⏸  Quiescent at {:#010x}", co);
                    break;
                }
            }
            StepEvent::Abandoned => {
                if trace {
                    println!(
                        "{:#010x}: <abandoned: interrupt {}>",
                        co,
                        cpu.get_interrupt_number()
                    );
                }
                orders += 1;
                if cpu.regs.co == co {
                    // No handler link installed; the order would fault
                    // forever.
                    eprintln!("❌ Unhandled access fault at CO={:#010x}", co);
                    break;
                }
            }
        }
        if let Some(message) = cpu.take_console_message() {
            println!("🔔 Console: {}", message);
        }
    }

    println!();
    println!("━━━ Result ━━━");
    println!("Orders executed: {}", orders);
    if json {
        match serde_json::to_string_pretty(&cpu.regs) {
            Ok(s) => println!("{}", s),
            Err(e) => eprintln!("❌ Failed to serialize registers: {}", e),
        }
    } else {
        print_registers(&cpu);
    }

    if orders >= max_orders {
        println!();
        println!(
            "⚠️  Reached max orders limit ({}). Use --max-orders to increase.",
            max_orders
        );
    }
}

fn print_registers(cpu: &Cpu) {
    let r = &cpu.regs;
    println!("CO  = {:#010x}   MS = {:#06x}", r.co, r.ms);
    println!(
        "NB  = {:#06x}  XNB = {:#06x}  SN = {:#06x}  SF = {:#06x}",
        r.nb, r.xnb, r.sn, r.sf
    );
    println!("B   = {:#010x} ({})", r.b, r.b as i32);
    println!("X   = {:#010x} ({})", r.x, r.x as i32);
    println!("A   = {:#018x} ({})", r.a, r.a as i64);
    println!("D   = {:#018x}", r.d);
    println!("XD  = {:#018x}", r.xd);
    println!(
        "AOD = {:#06x}  BOD = {:#06x}  DOD = {:#06x}",
        r.aod, r.bod, r.dod
    );
    println!("Interrupt signal: {}", cpu.get_interrupt_number());
}

fn demo_order_pipeline() {
    use mu5::cpu::decode::decode;

    println!("━━━ Order Decode Demo ━━━");
    println!();

    // B= 5; B+ 3; B=> NB[2]; JUMP -3
    let program: [&[u16]; 4] = [&[0x2005], &[0x2603], &[0x2482], &[0x003D]];
    for words in program {
        let mut rest = words[1..].iter().copied();
        let decoded = decode::<(), _>(words[0], || Ok(rest.next().unwrap_or(0))).unwrap();
        println!(
            "  {:04x} → {}  ({} word{})",
            words[0],
            decoded.order,
            decoded.words,
            if decoded.words == 1 { "" } else { "s" }
        );
    }
    println!();
    println!("✓ Decoder online. Try `mu5-emu test` for the full self-test.");
}

fn run_self_test() {
    use mu5::cpu::decode::{CR_B, FN_ADD, FN_LOAD, FN_STORE};
    use mu5::cpu::org::CONDITION_TABLE;
    use mu5::Descriptor;

    println!("━━━ MU5 Emulator Self-Test ━━━");
    println!();

    let mut passed = 0;
    let mut failed = 0;

    let word = |cr: u8, f: u8, k: u8, n: u8| {
        ((cr as u16) << 13) | ((f as u16) << 9) | ((k as u16) << 6) | (n as u16 & 0x3F)
    };

    // Test 1: descriptor pack/unpack round trip
    print!("Descriptor word round trip... ");
    let d = Descriptor::new(2, 4, 1000, 0xDEAD_BEEF);
    if Descriptor::from_word(d.to_word()) == d {
        println!("✓");
        passed += 1;
    } else {
        println!("✗");
        failed += 1;
    }

    // Test 2: condition table is the two-variable truth table
    print!("Boolean-order condition table... ");
    let mut ok = true;
    for func in 0..16usize {
        for index in 0..4usize {
            if CONDITION_TABLE[func][index] != (func >> index & 1 != 0) {
                ok = false;
            }
        }
    }
    if ok {
        println!("✓");
        passed += 1;
    } else {
        println!("✗");
        failed += 1;
    }

    // Test 3: load/add/store through the name segment
    print!("CPU load/add/store... ");
    let mut cpu = Cpu::new();
    cpu.regs.co = 0x1000;
    cpu.regs.ms = MS_EXEC;
    cpu.regs.nb = 0x4000;
    let program = [
        word(CR_B, FN_LOAD, 0, 10),
        word(CR_B, FN_ADD, 0, 5),
        word(CR_B, FN_STORE, 2, 1),
    ];
    for (i, w) in program.iter().enumerate() {
        cpu.store.write_16(0x1000 + i as u32 * 2, *w).unwrap();
    }
    for _ in 0..3 {
        cpu.execute_next_order();
    }
    if cpu.regs.b == 15 && cpu.store.read_32(0x4004).unwrap() == 15 {
        println!("✓");
        passed += 1;
    } else {
        println!(
            "✗ (B={}, name={:?})",
            cpu.regs.b,
            cpu.store.read_32(0x4004)
        );
        failed += 1;
    }

    // Test 4: inhibited user-mode overflow records without interrupting
    print!("Program-fault classification... ");
    let mut cpu = Cpu::new();
    cpu.regs.co = 0x1000;
    cpu.regs.ms = MS_INH_PROG_FAULT;
    let program = [
        word(CR_B, FN_LOAD, 7, 2),
        0x7FFF,
        0xFFFF,
        word(CR_B, FN_ADD, 0, 1),
    ];
    let mut at = 0x1000u32;
    for w in program {
        cpu.store.write_16(at, w).unwrap();
        at += 2;
    }
    cpu.execute_next_order();
    cpu.execute_next_order();
    if cpu.regs.bod != 0 && cpu.get_interrupt_number() == INTERRUPT_NONE {
        println!("✓");
        passed += 1;
    } else {
        println!("✗");
        failed += 1;
    }

    println!();
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("Results: {} passed, {} failed", passed, failed);

    if failed == 0 {
        println!("✓ All tests passed!");
    } else {
        std::process::exit(1);
    }
}
