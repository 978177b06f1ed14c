use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use thiserror::Error;

use crate::config::{ConfigError, LedgerConfig};
use crate::model::{AdminId, Bill, Brand, BrandId, CoinBalance, Command, TxId, User, UserId};
use crate::{Amount, ledger::ValidationError};

/// Errors that can occur when reading or writing csv files
#[derive(Debug, Error)]
pub enum CsvError {
    #[error("{path}: cannot open: {source}")]
    Open { path: String, source: csv::Error },

    #[error("line {line}: failed to parse row: {source}")]
    Parse { line: usize, source: csv::Error },

    #[error("line {line}: unrecognized operation '{op}'")]
    UnrecognizedOp { line: usize, op: String },

    #[error("line {line}: {op} missing {field}")]
    MissingField {
        line: usize,
        op: String,
        field: &'static str,
    },

    #[error("line {line}: {source}")]
    Config { line: usize, source: ConfigError },

    #[error("line {line}: {source}")]
    Brand {
        line: usize,
        source: ValidationError,
    },

    #[error("failed to write csv: {0}")]
    Write(#[from] csv::Error),
}

#[derive(Debug, Deserialize)]
struct CommandRow {
    op: String,
    user: Option<UserId>,
    brand: Option<BrandId>,
    tx: Option<TxId>,
    bill_amount: Option<Amount>,
    bill_date: Option<NaiveDate>,
    coins: Option<Amount>,
    admin: Option<AdminId>,
    reference: Option<String>,
    reason: Option<String>,
    notes: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConfigRow {
    key: String,
    value: String,
}

#[derive(Debug, Serialize)]
struct BalanceRow {
    user: UserId,
    balance: String,
    total_earned: String,
    total_redeemed: String,
}

fn reader(path: &Path) -> Result<csv::Reader<std::fs::File>, CsvError> {
    csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|source| CsvError::Open {
            path: path.display().to_string(),
            source,
        })
}

/// Deserialize every row of a headed csv file, tagging errors with their line
fn read_rows<T: DeserializeOwned>(
    path: &Path,
) -> Result<impl Iterator<Item = (usize, Result<T, CsvError>)> + use<T>, CsvError> {
    Ok(reader(path)?
        .into_deserialize::<T>()
        .enumerate()
        .map(|(idx, result)| {
            let line = idx + 2; // 1-indexed, skip header
            (line, result.map_err(|source| CsvError::Parse { line, source }))
        }))
}

/// Read brand configuration; any bad row fails the whole file
pub fn read_brands(path: impl AsRef<Path>) -> Result<Vec<Brand>, CsvError> {
    read_rows::<Brand>(path.as_ref())?
        .map(|(line, row)| {
            let brand = row?;
            brand
                .validate()
                .map_err(|source| CsvError::Brand { line, source })?;
            Ok(brand)
        })
        .collect()
}

pub fn read_users(path: impl AsRef<Path>) -> Result<Vec<User>, CsvError> {
    read_rows::<User>(path.as_ref())?
        .map(|(_, row)| row)
        .collect()
}

/// Read a `key,value` config file on top of the defaults
pub fn read_config(path: impl AsRef<Path>) -> Result<LedgerConfig, CsvError> {
    let mut config = LedgerConfig::default();
    for (line, row) in read_rows::<ConfigRow>(path.as_ref())? {
        let row = row?;
        config
            .set(&row.key, &row.value)
            .map_err(|source| CsvError::Config { line, source })?;
    }
    Ok(config)
}

fn required<T>(value: Option<T>, line: usize, op: &str, field: &'static str) -> Result<T, CsvError> {
    value.ok_or_else(|| CsvError::MissingField {
        line,
        op: op.to_string(),
        field,
    })
}

fn parse_command(line: usize, row: CommandRow) -> Result<Command, CsvError> {
    let op = row.op.as_str();
    let bill = |row: &CommandRow| -> Result<Bill, CsvError> {
        Ok(Bill {
            amount: required(row.bill_amount, line, op, "bill_amount")?,
            date: required(row.bill_date, line, op, "bill_date")?,
            receipt_url: None,
        })
    };

    let command = match op {
        "earn" => Command::Earn {
            user: required(row.user, line, op, "user")?,
            brand: required(row.brand, line, op, "brand")?,
            bill: bill(&row)?,
        },
        "redeem" => Command::Redeem {
            user: required(row.user, line, op, "user")?,
            brand: required(row.brand, line, op, "brand")?,
            bill: bill(&row)?,
            coins: required(row.coins, line, op, "coins")?,
        },
        "approve" => Command::Approve {
            tx: required(row.tx, line, op, "tx")?,
            admin: required(row.admin, line, op, "admin")?,
            notes: row.notes,
        },
        "reject" => Command::Reject {
            tx: required(row.tx, line, op, "tx")?,
            admin: required(row.admin, line, op, "admin")?,
            reason: required(row.reason, line, op, "reason")?,
            notes: row.notes,
        },
        "process" => Command::MarkProcessed {
            tx: required(row.tx, line, op, "tx")?,
            admin: required(row.admin, line, op, "admin")?,
            notes: row.notes,
        },
        "pay" => Command::Pay {
            tx: required(row.tx, line, op, "tx")?,
            admin: required(row.admin, line, op, "admin")?,
            reference: required(row.reference, line, op, "reference")?,
            notes: row.notes,
        },
        "welcome" => Command::WelcomeBonus {
            user: required(row.user, line, op, "user")?,
        },
        "adjust" => Command::Adjust {
            user: required(row.user, line, op, "user")?,
            admin: required(row.admin, line, op, "admin")?,
            amount: required(row.coins, line, op, "coins")?,
            notes: required(row.notes, line, op, "notes")?,
        },
        other => {
            return Err(CsvError::UnrecognizedOp {
                line,
                op: other.to_string(),
            });
        }
    };
    Ok(command)
}

/// Read ledger commands from a csv file, one result per row
pub fn read_commands(
    path: &Path,
) -> Result<impl Iterator<Item = Result<Command, CsvError>> + use<>, CsvError> {
    Ok(read_rows::<CommandRow>(path)?
        .map(|(line, row)| row.and_then(|row| parse_command(line, row))))
}

/// Write balances in csv format
pub fn write_balances(
    writer: impl io::Write,
    balances: impl IntoIterator<Item = CoinBalance>,
) -> Result<(), CsvError> {
    let mut writer = csv::Writer::from_writer(writer);

    for b in balances {
        let row = BalanceRow {
            user: b.user_id,
            balance: b.balance.to_string(),
            total_earned: b.total_earned.to_string(),
            total_redeemed: b.total_redeemed.to_string(),
        };
        writer.serialize(&row)?;
    }

    writer.flush().map_err(|e| CsvError::Write(e.into()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Percentage;
    use crate::model::UserStatus;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const COMMAND_HEADER: &str =
        "op,user,brand,tx,bill_amount,bill_date,coins,admin,reference,reason,notes\n";

    fn write_csv(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    fn commands(rows: &str) -> Vec<Result<Command, CsvError>> {
        let file = write_csv(&format!("{COMMAND_HEADER}{rows}"));
        read_commands(file.path()).unwrap().collect()
    }

    #[test]
    fn read_earn() {
        let results = commands("earn,1,2,,1000.50,2026-03-01,,,,,\n");
        assert_eq!(results.len(), 1);

        match results.into_iter().next().unwrap().unwrap() {
            Command::Earn { user, brand, bill } => {
                assert_eq!(user, 1);
                assert_eq!(brand, 2);
                assert_eq!(bill.amount, Amount::from_minor(100_050));
                assert_eq!(bill.date, NaiveDate::from_ymd_opt(2026, 3, 1).unwrap());
            }
            other => panic!("expected earn, got {other:?}"),
        }
    }

    #[test]
    fn read_pay_and_reject() {
        let results = commands(
            "pay,,,4,,,,9,ADMIN_TX_12345,,\n\
             reject,,,5,,,,9,,blurry receipt,called user\n",
        );
        assert_eq!(
            results[0].as_ref().unwrap(),
            &Command::Pay {
                tx: 4,
                admin: 9,
                reference: "ADMIN_TX_12345".to_string(),
                notes: None,
            }
        );
        assert_eq!(
            results[1].as_ref().unwrap(),
            &Command::Reject {
                tx: 5,
                admin: 9,
                reason: "blurry receipt".to_string(),
                notes: Some("called user".to_string()),
            }
        );
    }

    #[test]
    fn read_with_whitespace() {
        let results = commands("welcome , 3 , , , , , , , , ,\n");
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Ok(Command::WelcomeBonus { user: 3 })));
    }

    #[test]
    fn read_returns_error_for_unknown_op() {
        let results = commands("refund,1,,,,,,,,,\n");
        assert!(matches!(
            results[0],
            Err(CsvError::UnrecognizedOp { line: 2, .. })
        ));
    }

    #[test]
    fn read_returns_error_for_missing_field() {
        let results = commands("redeem,1,1,,500,2026-03-01,,,,,\n");
        assert!(matches!(
            results[0],
            Err(CsvError::MissingField {
                line: 2,
                field: "coins",
                ..
            })
        ));
    }

    #[test]
    fn read_returns_error_for_bad_amount() {
        let results = commands("earn,1,1,,10.555,2026-03-01,,,,,\n");
        assert!(matches!(results[0], Err(CsvError::Parse { line: 2, .. })));
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(matches!(
            read_commands(Path::new("/nonexistent/commands.csv")),
            Err(CsvError::Open { .. })
        ));
    }

    #[test]
    fn read_brands_and_users() {
        let brands = write_csv(
            "id,name,earning_percentage,redemption_percentage,min_redemption_amount,brandwise_max_cap,overall_max_cap,active\n\
             1,Acme,30,100,100,2000,,true\n",
        );
        let brands = read_brands(brands.path()).unwrap();
        assert_eq!(brands.len(), 1);
        assert_eq!(brands[0].earning_percentage, Percentage::from_whole(30).unwrap());
        assert_eq!(brands[0].brandwise_max_cap, Some(Amount::whole(2000)));
        assert_eq!(brands[0].overall_max_cap, None);

        let users = write_csv("id,status\n1,active\n2,blocked\n");
        let users = read_users(users.path()).unwrap();
        assert_eq!(users[1].status, UserStatus::Blocked);
    }

    #[test]
    fn misconfigured_brand_fails() {
        let brands = write_csv(
            "id,name,earning_percentage,redemption_percentage,min_redemption_amount,brandwise_max_cap,overall_max_cap,active\n\
             1,Acme,30,100,500,200,,true\n",
        );
        assert!(matches!(
            read_brands(brands.path()),
            Err(CsvError::Brand { line: 2, .. })
        ));
    }

    #[test]
    fn read_config_overrides_defaults() {
        let file = write_csv("key,value\nwelcome_bonus_coins,50\nmax_bill_age_days,10\n");
        let config = read_config(file.path()).unwrap();
        assert_eq!(config.welcome_bonus_coins, Amount::whole(50));
        assert_eq!(config.max_bill_age_days, 10);
        assert_eq!(config.version, LedgerConfig::default().version);

        let bad = write_csv("key,value\nbonus,50\n");
        assert!(matches!(
            read_config(bad.path()),
            Err(CsvError::Config { line: 2, .. })
        ));
    }

    #[test]
    fn write_balances_formats_rows() {
        let mut balance = CoinBalance::new(1);
        balance.balance = Amount::whole(300);
        balance.total_earned = Amount::whole(400);
        balance.total_redeemed = Amount::whole(100);

        let mut out = Vec::new();
        write_balances(&mut out, [balance]).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "user,balance,total_earned,total_redeemed\n1,300.00,400.00,100.00\n"
        );
    }
}
