use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::process;

use modesync::ipc;

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        usage();
        process::exit(1);
    }

    let cmd = args.join(" ");
    if ipc::parse_command(&cmd).is_none() {
        eprintln!("unknown command: {cmd}");
        usage();
        process::exit(1);
    }

    let path = ipc::socket_path();
    let mut stream = match UnixStream::connect(&path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("modesync not running ({path:?}): {e}");
            process::exit(1);
        }
    };

    if let Err(e) = writeln!(stream, "{cmd}") {
        eprintln!("failed to send command: {e}");
        process::exit(1);
    }

    let mut reply = String::new();
    if let Err(e) = BufReader::new(stream).read_line(&mut reply) {
        eprintln!("no reply from modesync: {e}");
        process::exit(1);
    }
    let reply = reply.trim();
    println!("{reply}");
    if reply.starts_with("error") {
        process::exit(1);
    }
}

fn usage() {
    eprintln!("usage: modesync-ctl <command>");
    eprintln!();
    eprintln!("commands:");
    eprintln!("  theme dark|light|auto     force a display mode or follow the system");
    eprintln!("  theme-toggle              flip the current appearance");
    eprintln!("  loaded <label>            signal that a frame finished loading");
    eprintln!("  ready <label>             deliver SHINY_READY from a frame's origin");
    eprintln!("  message <origin> <json>   deliver a raw inbound message");
    eprintln!("  status                    print mode and per-frame sync state");
}
