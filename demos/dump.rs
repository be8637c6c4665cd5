use std::env;
use std::fs::File;
use std::io::Read;
use ts_snip::{packet_header_and_payload, PidInfoManager, TransportAnalyzer};

fn main() {
    pretty_env_logger::init();
    let args = env::args();
    if args.len() < 2 {
        panic!("No file argument");
    }
    let file_path = args.skip(1).next().unwrap();

    let mut file = File::open(file_path).expect("unable to open!");
    let mut pids = PidInfoManager::new();
    let client = pids.register_client();
    let mut analyzer = TransportAnalyzer::new(client);

    let mut buf = vec![0u8; 188 * 1024];
    loop {
        let n = file.read(&mut buf).expect("IO Error!");
        if n == 0 {
            break;
        }
        let mut handler = |pid_info: &ts_snip::PidInfo, packet: &[u8; 188], offset: u64| -> bool {
            let (header, _) = packet_header_and_payload(packet).expect("Parse Error!");
            if header.pusi() {
                println!(
                    "offset {offset:#010x} pid {:#06x} ({:?}) pusi cc={}",
                    pid_info.pid(),
                    pid_info.stream_type(),
                    header.continuity_counter()
                );
            }
            true
        };
        analyzer.push_buffer(&mut pids, &buf[..n], &mut handler);
    }

    println!("pmt pid: {:?}", analyzer.pmt_pid());
    println!("distinct pids seen: {}", pids.pid_count());
}
