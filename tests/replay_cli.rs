use std::io::Write;

use assert_cmd::Command;
use predicates as pred;
use tempfile::NamedTempFile;

#[test]
fn replay_prints_settled_balances() {
    // customer 1 pays 600 for task 10 at the level-1 rate of 20%;
    // user 3 has one payout rejected and one completed
    let mut file = NamedTempFile::new().expect("create temp file");
    writeln!(
        file,
        "op,user,task,amount,arg\n\
    deposit,1,,1000,\n\
    profile,2,,,1\n\
    task,1,10,,\n\
    respond,2,10,600,\n\
    accept,1,10,,2\n\
    assign,1,10,,2\n\
    complete,1,10,,\n\
    teleport,1,,,\n\
    complete,1,10,,\n\
    deposit,3,,5000,\n\
    withdraw,3,,1000,+7 999 123-45-67\n\
    payout,3,,,REJECTED\n\
    withdraw,3,,2000,89991234567\n\
    payout,3,,,COMPLETED"
    )
    .unwrap();

    let exe = env!("CARGO_BIN_EXE_settlement_engine");
    let mut cmd = Command::new(exe);
    cmd.env("ENGINE_PLATFORM_ACCOUNT", "0")
        .env("GATEWAY_PASSWORD", "replay-secret")
        .arg("replay")
        .arg(file.path());

    cmd.assert()
        .success()
        .stdout(pred::str::contains("user,balance,frozen,available"))
        .stdout(pred::str::contains("0,120.00,0.00,120.00"))
        .stdout(pred::str::contains("1,400.00,0.00,400.00"))
        .stdout(pred::str::contains("2,480.00,0.00,480.00"))
        .stdout(pred::str::contains("3,3000.00,0.00,3000.00"));
}

#[test]
fn missing_subcommand_fails_with_usage() {
    let exe = env!("CARGO_BIN_EXE_settlement_engine");
    Command::new(exe)
        .assert()
        .failure()
        .stderr(pred::str::contains("usage"));
}
