use std::collections::BTreeMap;
use std::io::Write;

use crate::domain::{Account, Error, UserId};

/// Writes one `user,balance,frozen,available` row per account, ordered by user.
pub fn write_balances<W: Write>(accounts: &BTreeMap<UserId, Account>, out: W) -> Result<(), Error> {
    let mut writer = csv::Writer::from_writer(out);
    writer.write_record(["user", "balance", "frozen", "available"])?;
    for (user_id, account) in accounts {
        writer.write_record([
            user_id.to_string(),
            account.balance.to_string(),
            account.frozen.to_string(),
            account.available().to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Money;

    #[test]
    fn rows_are_sorted_and_fixed_point() {
        let mut accounts = BTreeMap::new();
        accounts.insert(
            9,
            Account {
                balance: Money::from_units(480),
                frozen: Money::ZERO,
            },
        );
        accounts.insert(
            1,
            Account {
                balance: Money::from_units(1000),
                frozen: Money::from_units(600),
            },
        );

        let mut out = Vec::new();
        write_balances(&accounts, &mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "user,balance,frozen,available\n1,1000.00,600.00,400.00\n9,480.00,0.00,480.00\n"
        );
    }
}
