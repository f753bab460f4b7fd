//! apfsro-tool — inspect APFS container images
//!
//! # Usage
//!
//! ```text
//! apfsro-tool info  <image> [-o options]     Volume and space statistics
//! apfsro-tool check <image> [-o options]     Mount and verify, report OK
//!
//! Options are the mount option string, e.g. -o vol=1,uid=501
//! ```

mod style;

use std::env;
use std::path::Path;
use std::process;

use apfsro::{ApfsMount, ImageReader, Result};
use style::{format_commas, format_size, BOLD, DIM, GREEN, RED, RESET};

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let result = match args[1].as_str() {
        "info" => info(&args[2..]),
        "check" => check(&args[2..]),
        "-h" | "--help" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            eprintln!("{RED}Unknown command: {}{RESET}", args[1]);
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("{RED}error:{RESET} {} {DIM}(errno {}){RESET}", e, e.errno());
        process::exit(1);
    }
}

fn print_usage() {
    eprintln!(
        r#"
{BOLD}apfsro-tool{RESET} — inspect APFS container images

{BOLD}COMMANDS:{RESET}
    {GREEN}info{RESET}   <image> [-o options]     Volume and space statistics
    {GREEN}check{RESET}  <image> [-o options]     Mount and verify, report OK

{BOLD}OPTIONS:{RESET}
    -o <options>    Mount option string: vol=<n>,uid=<n>,gid=<n>
"#
    );
}

/// Split `<image> [-o options]` out of the argument list.
fn split_args(args: &[String]) -> Option<(&str, String)> {
    let image = args.first()?.as_str();
    let mut options = String::new();
    let mut rest = args[1..].iter();
    while let Some(arg) = rest.next() {
        if arg == "-o" {
            options = rest.next()?.clone();
        } else {
            return None;
        }
    }
    Some((image, options))
}

fn open(image: &str, options: &str) -> Result<ApfsMount<ImageReader<std::io::BufReader<std::fs::File>>>> {
    let dev = ImageReader::open(Path::new(image))?;
    ApfsMount::open(dev, options)
}

fn info(args: &[String]) -> Result<()> {
    let Some((image, options)) = split_args(args) else {
        print_usage();
        process::exit(1);
    };

    let mount = open(image, &options)?;
    let vol = mount.volume();
    let stats = mount.statfs()?;
    let block_size = stats.block_size as u64;

    println!("{BOLD}Volume:{RESET}      {} {DIM}(slot {}){RESET}", vol.volume_name, mount.options().vol);
    println!("{BOLD}Block size:{RESET}  {}", stats.block_size);
    println!(
        "{BOLD}Capacity:{RESET}    {} {DIM}({} blocks){RESET}",
        format_size(stats.total_blocks * block_size),
        format_commas(stats.total_blocks)
    );
    println!(
        "{BOLD}Free:{RESET}        {} {DIM}({} blocks){RESET}",
        format_size(stats.free_blocks * block_size),
        format_commas(stats.free_blocks)
    );
    println!("{BOLD}Objects:{RESET}     {}", format_commas(stats.files));
    println!("{BOLD}fsid:{RESET}        0x{:016X}", stats.fsid);

    Ok(())
}

fn check(args: &[String]) -> Result<()> {
    let Some((image, options)) = split_args(args) else {
        print_usage();
        process::exit(1);
    };

    let mount = open(image, &options)?;
    mount.statfs()?;
    println!(
        "{GREEN}OK{RESET} {} mounts read-only, volume {:?} intact",
        image, mount.volume().volume_name
    );
    Ok(())
}
