use std::process::Command;

struct Output {
    stdout: String,
    stderr: String,
    code: Option<i32>,
}

fn run_with(args: &[&str]) -> Output {
    let output = Command::new(env!("CARGO_BIN_EXE_coin-ledger"))
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .expect("failed to run binary");

    Output {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        code: output.status.code(),
    }
}

fn run(commands: &str, config: Option<&str>) -> Output {
    let commands = format!("tests/fixtures/{commands}");
    let mut args = vec![
        "tests/fixtures/brands.csv",
        "tests/fixtures/users.csv",
        commands.as_str(),
    ];
    if let Some(config) = config {
        args.push(config);
    }
    run_with(&args)
}

#[test]
fn valid_commands() {
    let out = run("valid.csv", Some("tests/fixtures/config.csv"));

    assert_eq!(out.code, Some(0));
    assert!(out.stderr.is_empty(), "unexpected stderr: {}", out.stderr);

    let lines: Vec<&str> = out.stdout.lines().collect();
    assert_eq!(
        lines,
        vec![
            "user,balance,total_earned,total_redeemed",
            "1,400.00,500.00,100.00",
            "2,74.50,120.00,45.50",
        ]
    );
}

#[test]
fn errors_warn_but_do_not_block() {
    let out = run("with_errors.csv", Some("tests/fixtures/config.csv"));

    assert_eq!(out.code, Some(0));
    assert!(out.stderr.contains("unrecognized operation 'refund'"));
    assert!(out.stderr.contains("redeem missing coins"));

    let lines: Vec<&str> = out.stdout.lines().collect();
    assert_eq!(lines[0], "user,balance,total_earned,total_redeemed");
    assert_eq!(lines[1], "1,50.00,100.00,50.00");
    assert_eq!(lines.len(), 2);
}

#[test]
fn default_config_refuses_old_bills() {
    // fixture bills are dated 2025, well outside the default 30 day window
    let out = run("valid.csv", None);

    assert_eq!(out.code, Some(0));
    let lines: Vec<&str> = out.stdout.lines().collect();
    assert_eq!(
        lines,
        vec![
            "user,balance,total_earned,total_redeemed",
            "1,100.00,100.00,0.00",
            "2,74.50,100.00,25.50",
        ]
    );
}

#[test]
fn missing_arguments_print_usage() {
    let out = run_with(&["tests/fixtures/brands.csv"]);

    assert_eq!(out.code, Some(2));
    assert!(out.stderr.contains("usage: coin-ledger"));
    assert!(out.stdout.is_empty());
}

#[test]
fn missing_input_fails() {
    let out = run("does_not_exist.csv", None);

    assert_eq!(out.code, Some(1));
    assert!(out.stderr.contains("cannot open"));
    assert!(out.stdout.is_empty());
}
