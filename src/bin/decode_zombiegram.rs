use std::env;

use zombiegram_node::zombiegram::Zombiegram;

// Small CLI to help debug raw Zombiegram frames captured off the mesh.
// Usage:
//   cargo run --bin decode_zombiegram -- <hex_frame>
// Reads env var ZOMBIE_TRUST_KEY (plain text) to also report the trust verdict.
fn main() {
    let mut args = std::env::args().skip(1).collect::<Vec<_>>();
    if args.is_empty() {
        eprintln!("Usage: decode_zombiegram <hex_frame>\n\nEnvironment:\n  ZOMBIE_TRUST_KEY   shared trust key for the HMAC verdict (optional)\n");
        std::process::exit(2);
    }
    let frame_hex = args.remove(0);
    let frame = match hex::decode(frame_hex.trim()) {
        Ok(frame) => frame,
        Err(e) => {
            println!("decode: ERR  frame is not valid hex: {e}");
            std::process::exit(1);
        }
    };

    match Zombiegram::from_bytes(&frame) {
        Ok(zg) => {
            let trust_key = env::var("ZOMBIE_TRUST_KEY").ok();
            let trusted = zg.is_trusted(trust_key.as_deref().map(str::as_bytes));
            println!(
                "decode: OK  source_id={:08x} seq_num={} hmac={:08x}",
                zg.source_id(),
                zg.seq_num(),
                zg.hmac()
            );
            match serde_json::to_string_pretty(&zg.to_bridge_json(trusted)) {
                Ok(doc) => println!("explained: {doc}"),
                Err(e) => println!("explained: <unserializable: {e}>"),
            }
        }
        Err(e) => {
            // Print a clear error reason to match the router logs
            println!("decode: ERR  {e}");
            std::process::exit(1);
        }
    }
}
