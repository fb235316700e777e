use clap::{Arg, ArgAction, ArgMatches, Command};

use rinit::app;
use rinit::app::client::{Client, ClientError};
use rinit::app::proto::Op;

fn cli() -> Command {
    Command::new("rinit")
        .version(env!("CARGO_PKG_VERSION"))
        .about("A process-one service supervisor")
        .arg(
            Arg::new("socket")
                .short('s')
                .long("socket")
                .value_name("PATH")
                .default_value("/run/rinit.sock")
                .global(true)
                .help("control socket path"),
        )
        .subcommand(
            Command::new("init")
                .about("run as the supervisor, start and maintain configured services")
                .arg(
                    Arg::new("config")
                        .value_name("DIR")
                        .short('c')
                        .long("config")
                        .default_value("/etc/rinit.d/")
                        .help("service configurations directory"),
                )
                .arg(
                    Arg::new("runlevel")
                        .short('r')
                        .long("runlevel")
                        .value_name("LEVEL")
                        .value_parser(clap::value_parser!(u8).range(1..=9))
                        .default_value("2")
                        .help("runlevel to enter after bootstrap"),
                )
                .arg(
                    Arg::new("container")
                        .long("container")
                        .action(ArgAction::SetTrue)
                        .help("not pid 1: exit instead of rebooting on shutdown"),
                )
                .arg(
                    Arg::new("debug")
                        .short('d')
                        .long("debug")
                        .action(ArgAction::SetTrue)
                        .help("run in debug mode"),
                ),
        )
        .subcommand(
            Command::new("status")
                .arg(Arg::new("service").value_name("SERVICE").help("service name"))
                .about("show service status, or all services when no name is given"),
        )
        .subcommand(
            Command::new("start")
                .arg(Arg::new("service").value_name("SERVICE").required(true))
                .about("start a service"),
        )
        .subcommand(
            Command::new("stop")
                .arg(Arg::new("service").value_name("SERVICE").required(true))
                .about("stop a service"),
        )
        .subcommand(
            Command::new("restart")
                .arg(Arg::new("service").value_name("SERVICE").required(true))
                .about("restart a service, via SIGHUP when it supports that"),
        )
        .subcommand(
            Command::new("signal")
                .arg(Arg::new("service").value_name("SERVICE").required(true))
                .arg(
                    Arg::new("signal")
                        .value_name("SIGNAL")
                        .required(true)
                        .help("signal name or number (example: SIGTERM)"),
                )
                .about("send a signal to a running service"),
        )
        .subcommand(Command::new("reload").about("re-read configuration and reconcile services"))
        .subcommand(
            Command::new("runlevel")
                .arg(Arg::new("level").value_name("LEVEL").help("runlevel 0-9 or S"))
                .about("show or change the runlevel"),
        )
        .subcommand(
            Command::new("query")
                .arg(Arg::new("service").value_name("SERVICE").required(true))
                .about("check whether a service exists"),
        )
        .subcommand(
            Command::new("cond")
                .arg(
                    Arg::new("op")
                        .value_name("OP")
                        .required(true)
                        .help("get, set or clear"),
                )
                .arg(Arg::new("name").value_name("NAME").required(true))
                .about("inspect or change a condition"),
        )
        .subcommand(Command::new("debug").about("toggle supervisor debug logging"))
        .subcommand(Command::new("reboot").about("stop everything and reboot"))
        .subcommand(Command::new("halt").about("stop everything and halt"))
        .subcommand(Command::new("poweroff").about("stop everything and power off"))
        .subcommand(Command::new("suspend").about("stop everything and suspend"))
}

async fn run(matches: ArgMatches) -> i32 {
    let socket = matches.get_one::<String>("socket").unwrap().clone();
    let client = Client::new(&socket);

    let result: Result<(), ClientError> = match matches.subcommand() {
        Some(("init", m)) => {
            let opts = app::InitOpts {
                config: m.get_one::<String>("config").unwrap().clone(),
                socket,
                runlevel: *m.get_one::<u8>("runlevel").unwrap(),
                container: m.get_flag("container"),
                debug: m.get_flag("debug"),
            };
            return match app::init(opts).await {
                Ok(()) => 0,
                Err(err) => {
                    eprintln!("rinit: {:#}", err);
                    1
                }
            };
        }
        Some(("status", m)) => match m.get_one::<String>("service") {
            Some(service) => client.status(service).await,
            None => client.list().await,
        },
        Some(("start", m)) => client.start(m.get_one::<String>("service").unwrap()).await,
        Some(("stop", m)) => client.stop(m.get_one::<String>("service").unwrap()).await,
        Some(("restart", m)) => client.restart(m.get_one::<String>("service").unwrap()).await,
        Some(("signal", m)) => {
            client
                .signal(
                    m.get_one::<String>("service").unwrap(),
                    m.get_one::<String>("signal").unwrap(),
                )
                .await
        }
        Some(("reload", _)) => client.reload().await,
        Some(("runlevel", m)) => {
            client
                .runlevel(m.get_one::<String>("level").map(String::as_str))
                .await
        }
        Some(("query", m)) => client.query(m.get_one::<String>("service").unwrap()).await,
        Some(("cond", m)) => {
            client
                .cond(
                    m.get_one::<String>("op").unwrap(),
                    m.get_one::<String>("name").unwrap(),
                )
                .await
        }
        Some(("debug", _)) => client.debug().await,
        Some(("reboot", _)) => client.power(Op::Reboot).await,
        Some(("halt", _)) => client.power(Op::Halt).await,
        Some(("poweroff", _)) => client.power(Op::Poweroff).await,
        Some(("suspend", _)) => client.power(Op::Suspend).await,
        _ => client.list().await, // default command
    };

    match result {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("rinit: {}", err);
            err.exit_code()
        }
    }
}

fn main() {
    let matches = cli().get_matches();

    // single-threaded by design: the supervisor is one cooperative loop
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build runtime");

    let code = rt.block_on(run(matches));
    std::process::exit(code);
}
