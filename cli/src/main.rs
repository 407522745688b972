//! rpcshield CLI — inspect configuration and exercise breakers and rate
//! limiters from the terminal.
//!
//! Usage:
//! ```bash
//! # Print the effective configuration (file + RPCSHIELD_* environment)
//! rpcshield config --file shield.json
//!
//! # Feed an outcome sequence through a breaker: s = success, f = failure,
//! # w = wait out the reset timeout
//! rpcshield breaker --pattern fffwsss --threshold 3 --reset-ms 200
//!
//! # Fire requests at a token bucket
//! rpcshield limiter --capacity 10 --rate 5 --requests 15 --interval-ms 50
//! ```

use std::env;
use std::path::Path;
use std::process;
use std::time::{Duration, Instant};

use rpcshield_core::policy::RateLimiterConfig;
use rpcshield_core::{
    init_tracing, CircuitBreaker, CircuitBreakerConfig, CircuitError, ShieldConfig, TokenBucket,
};

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let result = match args[1].as_str() {
        "config" => cmd_config(&args[2..]),
        "breaker" => cmd_breaker(&args[2..]).await,
        "limiter" => cmd_limiter(&args[2..]).await,
        "version" | "--version" | "-V" => {
            println!("rpcshield {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn print_usage() {
    println!("rpcshield {}", env!("CARGO_PKG_VERSION"));
    println!("Circuit breaker and rate limiter toolkit for RPC servers\n");
    println!("USAGE:");
    println!("    rpcshield <COMMAND>\n");
    println!("COMMANDS:");
    println!("    config     Print the effective configuration as JSON");
    println!("    breaker    Feed an outcome pattern through a circuit breaker");
    println!("    limiter    Fire requests at a token bucket");
    println!("    version    Print version");
    println!("    help       Print this help\n");
    println!("CONFIG FLAGS:");
    println!("    --file <PATH>        JSON config file (default: environment only)\n");
    println!("BREAKER FLAGS:");
    println!("    --pattern <s|f|w..>  Outcomes: s=success f=failure w=wait reset  [required]");
    println!("    --threshold <N>      Failures before opening (default 3)");
    println!("    --reset-ms <N>       Open duration in milliseconds (default 1000)\n");
    println!("LIMITER FLAGS:");
    println!("    --capacity <C>       Bucket capacity (default 10)");
    println!("    --rate <R>           Refill rate, tokens/second (default 5)");
    println!("    --requests <N>       Requests to send (default 15)");
    println!("    --interval-ms <N>    Delay between requests (default 0)");
}

/// Load config from `--file` or the environment and start logging.
fn load_config(args: &[String]) -> Result<ShieldConfig, String> {
    let file = parse_flag(args, "--file");
    let config = match &file {
        Some(path) => ShieldConfig::load(Path::new(path)),
        None => ShieldConfig::from_env(),
    }
    .map_err(|e| e.to_string())?;
    init_tracing(&config.log);
    tracing::debug!(
        file = file.as_deref().unwrap_or("<env>"),
        log_level = %config.log.level,
        "Configuration loaded"
    );
    Ok(config)
}

fn cmd_config(args: &[String]) -> Result<(), String> {
    let config = load_config(args)?;
    let json = serde_json::to_string_pretty(&config).map_err(|e| e.to_string())?;
    println!("{json}");
    Ok(())
}

async fn cmd_breaker(args: &[String]) -> Result<(), String> {
    let base = load_config(args)?;
    let pattern = parse_flag(args, "--pattern").ok_or("--pattern is required")?;
    let config = CircuitBreakerConfig {
        failure_threshold: parse_num(args, "--threshold", 3)?,
        reset_timeout: Duration::from_millis(parse_num(args, "--reset-ms", 1000)?),
        ..base.circuit_breaker
    };
    config.validate().map_err(|e| e.to_string())?;
    let reset_timeout = config.reset_timeout;
    let breaker = CircuitBreaker::new("cli", config);

    println!(
        "Breaker: threshold={} reset={}ms",
        breaker.config().failure_threshold,
        reset_timeout.as_millis()
    );

    for (i, step) in pattern.chars().enumerate() {
        let succeed = match step {
            's' | 'S' => true,
            'f' | 'F' => false,
            'w' | 'W' => {
                tokio::time::sleep(reset_timeout).await;
                println!("  #{:<3} waited {}ms", i + 1, reset_timeout.as_millis());
                continue;
            }
            other => return Err(format!("invalid pattern character {other:?}")),
        };

        let result = breaker
            .call(|| async move {
                if succeed {
                    Ok(())
                } else {
                    Err("simulated failure")
                }
            })
            .await;

        let outcome = match result {
            Ok(()) => "ok".to_string(),
            Err(CircuitError::Operation(e)) => format!("failed: {e}"),
            Err(e) => format!("rejected: {e}"),
        };
        println!("  #{:<3} {:<42} → {}", i + 1, outcome, breaker.state());
    }

    let stats = serde_json::to_string_pretty(&breaker.stats()).map_err(|e| e.to_string())?;
    println!("\n{stats}");
    Ok(())
}

async fn cmd_limiter(args: &[String]) -> Result<(), String> {
    load_config(args)?;
    let config = RateLimiterConfig {
        capacity: parse_num(args, "--capacity", 10.0)?,
        refill_rate: parse_num(args, "--rate", 5.0)?,
    };
    if !(config.capacity > 0.0) || !(config.refill_rate >= 0.0) {
        return Err("--capacity must be positive and --rate non-negative".into());
    }
    let requests: u32 = parse_num(args, "--requests", 15)?;
    let interval = Duration::from_millis(parse_num(args, "--interval-ms", 0)?);

    let bucket = TokenBucket::new(config);
    let start = Instant::now();
    let mut admitted = 0u32;

    println!(
        "Bucket: capacity={} rate={}/s",
        config.capacity, config.refill_rate
    );
    for i in 0..requests {
        if i > 0 && !interval.is_zero() {
            tokio::time::sleep(interval).await;
        }
        let ok = bucket.consume(1);
        if ok {
            admitted += 1;
        }
        println!(
            "  #{:<3} t={:>6}ms  {:<8} tokens={:.2}",
            i + 1,
            start.elapsed().as_millis(),
            if ok { "allowed" } else { "denied" },
            bucket.available()
        );
    }
    tracing::info!(admitted, requests, "Limiter run finished");
    println!("\nAdmitted {admitted}/{requests}");
    Ok(())
}

fn parse_flag(args: &[String], flag: &str) -> Option<String> {
    let pos = args.iter().position(|a| a == flag)?;
    args.get(pos + 1).cloned()
}

fn parse_num<T: std::str::FromStr>(args: &[String], flag: &str, default: T) -> Result<T, String> {
    match parse_flag(args, flag) {
        Some(raw) => raw
            .parse()
            .map_err(|_| format!("{flag}: expected a number, got {raw:?}")),
        None => Ok(default),
    }
}
