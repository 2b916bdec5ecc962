//! Relay Agent - 设备端反向隧道代理
//!
//! Usage:
//! - Orchestrator + control API: `relay-agent run`
//! - Resident guard (tier A): `relay-agent guard`
//! - Scheduled check (tier B/C): `relay-agent tick --source scheduler|work-queue`
//! - Install tiers B/C and start the guard: `relay-agent install-watchdogs`
//! - Remove tiers B/C, stop the guard and the aux tool: `relay-agent uninstall`

use relay_agent::config::EnvConfig;
use relay_agent::services::watchdog::TriggerSource;

/// 子命令
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Run,
    Guard,
    GuardStop,
    Tick(TriggerSource),
    InstallWatchdogs,
    Uninstall,
    Status,
    Help,
}

/// 解析命令行参数
fn parse_args(args: &[String]) -> Result<Command, String> {
    let Some(command) = args.get(1) else {
        return Ok(Command::Run);
    };

    match command.as_str() {
        "run" => Ok(Command::Run),
        "guard" => Ok(Command::Guard),
        "guard-stop" => Ok(Command::GuardStop),
        "install-watchdogs" => Ok(Command::InstallWatchdogs),
        "uninstall" => Ok(Command::Uninstall),
        "status" => Ok(Command::Status),
        "help" | "--help" | "-h" => Ok(Command::Help),
        "tick" => {
            let mut source = TriggerSource::Scheduler;
            let mut i = 2;
            while i < args.len() {
                match args[i].as_str() {
                    "--source" if i + 1 < args.len() => {
                        source = args[i + 1].parse()?;
                        i += 2;
                    }
                    other => return Err(format!("unexpected argument: {}", other)),
                }
            }
            Ok(Command::Tick(source))
        }
        other => Err(format!("unknown command: {}", other)),
    }
}

fn print_help() {
    println!("Relay Agent - 设备端反向隧道代理");
    println!();
    println!("USAGE:");
    println!("    relay-agent [COMMAND]");
    println!();
    println!("COMMANDS:");
    println!("    run                          Run the orchestrator and control API (default)");
    println!("    guard                        Run the resident guard process");
    println!("    guard-stop                   Stop the guard without resurrection");
    println!("    tick --source <SOURCE>       One watchdog check (scheduler | work-queue)");
    println!("    install-watchdogs            Install cron/systemd triggers and start the guard");
    println!("    uninstall                    Remove triggers, stop the guard, remove the aux tool");
    println!("    status                       Show process and service status");
    println!("    help                         Print help information");
    println!();
    println!("ENVIRONMENT:");
    println!("    FRP_SERVER_ADDR, FRP_SERVER_PORT, FRP_TOKEN, FRP_REMOTE_PORT");
    println!("    RELAY_AGENT_ROOT, RELAY_AGENT_PORT, RELAY_AGENT_API_KEY, RUST_LOG");
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let command = match parse_args(&args) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            std::process::exit(2);
        }
    };

    if command == Command::Help {
        print_help();
        return;
    }

    relay_agent::init_tracing();
    let config = EnvConfig::load();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: failed to create runtime: {}", e);
            std::process::exit(1);
        }
    };

    let result = rt.block_on(async move {
        match command {
            Command::Run => relay_agent::run_agent(config).await,
            Command::Guard => relay_agent::run_guard(config).await,
            Command::GuardStop => relay_agent::stop_guard(&config),
            Command::Tick(source) => relay_agent::run_tick(config, source).await,
            Command::InstallWatchdogs => relay_agent::install_watchdogs(config).await,
            Command::Uninstall => relay_agent::uninstall(config).await,
            Command::Status => relay_agent::print_status(config).await,
            Command::Help => Ok(()),
        }
    });

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("relay-agent")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_parse_args() {
        assert_eq!(parse_args(&args(&[])), Ok(Command::Run));
        assert_eq!(parse_args(&args(&["guard"])), Ok(Command::Guard));
        assert_eq!(parse_args(&args(&["uninstall"])), Ok(Command::Uninstall));
        assert_eq!(
            parse_args(&args(&["tick", "--source", "work-queue"])),
            Ok(Command::Tick(TriggerSource::WorkQueue))
        );
        assert_eq!(
            parse_args(&args(&["tick"])),
            Ok(Command::Tick(TriggerSource::Scheduler))
        );
        assert!(parse_args(&args(&["tick", "--source", "nope"])).is_err());
        assert!(parse_args(&args(&["deploy"])).is_err());
    }
}
