//! Development stand-in for a control engine. Accepts connections on the
//! QRC port, reports itself active and pushes a change poll for every group
//! a client enables AutoPoll on.
//!
//! Flags: `--port <n>` (default 1710), `--standby` to report Standby instead
//! of Active.

use qsys_core_link::codec::{self, FrameDecoder};
use qsys_core_link::config::DEFAULT_QRC_PORT;
use qsys_core_link::protocol::{
    JSONRPC_VERSION, METHOD_AUTO_POLL, METHOD_CHANGE_GROUP_POLL, METHOD_ENGINE_STATUS,
    METHOD_LOGON, METHOD_NO_OP,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Duration, Instant};

const MIN_POLL_PERIOD: Duration = Duration::from_millis(50);

struct Options {
    port: u16,
    standby: bool,
}

fn parse_options() -> Result<Options, Box<dyn std::error::Error>> {
    let mut options = Options {
        port: DEFAULT_QRC_PORT,
        standby: false,
    };
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--port" => {
                options.port = args.next().ok_or("missing value for --port")?.parse()?;
            }
            "--standby" => options.standby = true,
            other => return Err(format!("unknown argument: {other}").into()),
        }
    }
    Ok(options)
}

struct PollGroup {
    period: Duration,
    next_due: Instant,
    counter: u64,
}

async fn serve(
    mut stream: TcpStream,
    peer: SocketAddr,
    standby: bool,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let state = if standby { "Standby" } else { "Active" };
    write_frame(
        &mut stream,
        &json!({
            "jsonrpc": JSONRPC_VERSION,
            "method": METHOD_ENGINE_STATUS,
            "params": {
                "State": state,
                "DesignName": "mock-design",
                "Platform": "mock-core",
                "IsRedundant": false
            }
        }),
    )
    .await?;
    println!("-> {peer} EngineStatus {state}");

    let mut decoder = FrameDecoder::new();
    let mut groups: BTreeMap<String, PollGroup> = BTreeMap::new();
    let mut ticker = tokio::time::interval(MIN_POLL_PERIOD);
    let mut buf = vec![0u8; 8 * 1024];

    loop {
        tokio::select! {
            read = stream.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    println!("<- {peer} closed");
                    return Ok(());
                }
                for frame in decoder.feed(&buf[..n]) {
                    match frame {
                        Ok(frame) => {
                            if let Some(reply) = handle_request(peer, &frame, &mut groups) {
                                write_frame(&mut stream, &reply).await?;
                            }
                        }
                        Err(err) => eprintln!("<- {peer} bad frame: {err}"),
                    }
                }
            }
            _ = ticker.tick() => {
                let now = Instant::now();
                for (id, group) in groups.iter_mut() {
                    if now < group.next_due {
                        continue;
                    }
                    group.next_due = now + group.period;
                    group.counter += 1;
                    let poll = json!({
                        "jsonrpc": JSONRPC_VERSION,
                        "method": METHOD_CHANGE_GROUP_POLL,
                        "params": {
                            "Id": id,
                            "Changes": [{
                                "Name": format!("{id} meter"),
                                "Value": group.counter,
                                "String": group.counter.to_string()
                            }]
                        }
                    });
                    write_frame(&mut stream, &poll).await?;
                }
            }
        }
    }
}

fn handle_request(
    peer: SocketAddr,
    frame: &Value,
    groups: &mut BTreeMap<String, PollGroup>,
) -> Option<Value> {
    let method = frame.get("method").and_then(Value::as_str).unwrap_or("");
    let id = frame.get("id").cloned();
    match method {
        METHOD_NO_OP => {
            println!("<- {peer} NoOp");
        }
        METHOD_LOGON => {
            let user = frame
                .pointer("/params/User")
                .and_then(Value::as_str)
                .unwrap_or("");
            println!("<- {peer} Logon user={user}");
        }
        METHOD_AUTO_POLL => {
            let group = frame
                .pointer("/params/Id")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            let rate = frame
                .pointer("/params/Rate")
                .and_then(Value::as_f64)
                .unwrap_or(1.0);
            let period = Duration::try_from_secs_f64(rate)
                .unwrap_or(Duration::from_secs(1))
                .max(MIN_POLL_PERIOD);
            println!("<- {peer} AutoPoll {group} every {period:?}");
            groups.insert(
                group,
                PollGroup {
                    period,
                    next_due: Instant::now() + period,
                    counter: 0,
                },
            );
        }
        other => {
            println!("<- {peer} {other} {frame}");
        }
    }
    id.map(|id| json!({"jsonrpc": JSONRPC_VERSION, "id": id, "result": true}))
}

async fn write_frame(stream: &mut TcpStream, message: &Value) -> std::io::Result<()> {
    let bytes = codec::encode(message)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string()))?;
    stream.write_all(&bytes).await
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let options = parse_options()?;
    let listener = TcpListener::bind(("0.0.0.0", options.port)).await?;
    println!("mock-core: listening on {}", listener.local_addr()?);

    loop {
        let (stream, peer) = listener.accept().await?;
        println!("mock-core: accepted {peer}");
        let standby = options.standby;
        tokio::spawn(async move {
            if let Err(err) = serve(stream, peer, standby).await {
                eprintln!("mock-core: {peer} error: {err}");
            }
        });
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    run().await
}
