use regex::Regex;
use std::future::Future;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::Error;

/// Splits a quantity into its integer, fraction, exponent and unit
static QUANTITY_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([0-9]*)(?:\.([0-9]*))?(?:[eE]([+-]?[0-9]+))?(Ki|Mi|Gi|Ti|Pi|Ei|n|u|m|k|M|G|T|P|E)?$")
        .unwrap()
});

/// Parse a k8s quantity and scale it by a power of ten, rounding up
///
/// Supports plain and exponent notation along with the decimal (`n`, `u`,
/// `m`, `k`, `M`, `G`, `T`, `P`, `E`) and binary (`Ki` .. `Ei`) suffixes. All
/// math is done on integers so values like `100m` land exactly.
///
/// # Arguments
///
/// * `raw` - The raw quantity to parse
/// * `scale` - The power of ten to multiply the base value by
fn quantity(raw: &str, scale: i32) -> Result<u64, Error> {
    let raw = raw.trim();
    let captures = match QUANTITY_REGEX.captures(raw) {
        Some(captures) => captures,
        None => return Err(Error::new(format!("Failed to parse quantity: {raw}"))),
    };
    let whole = captures.get(1).map_or("", |m| m.as_str());
    let fraction = captures.get(2).map_or("", |m| m.as_str());
    // a quantity needs at least one digit
    if whole.is_empty() && fraction.is_empty() {
        return Err(Error::new(format!("Failed to parse quantity: {raw}")));
    }
    // build our mantissa from every digit we were given
    let digits = format!("{whole}{fraction}");
    let mantissa = digits
        .parse::<u128>()
        .map_err(|_| Error::new(format!("Invalid quantity value: {raw}")))?;
    // get our exponent if one was set
    let exponent = match captures.get(3) {
        Some(exp) => exp
            .as_str()
            .parse::<i32>()
            .map_err(|_| Error::new(format!("Invalid quantity exponent: {raw}")))?,
        None => 0,
    };
    // get the power of ten and power of two for our unit
    let (tens, twos) = match captures.get(4).map(|unit| unit.as_str()) {
        None => (0, 0),
        Some("n") => (-9, 0),
        Some("u") => (-6, 0),
        Some("m") => (-3, 0),
        Some("k") => (3, 0),
        Some("M") => (6, 0),
        Some("G") => (9, 0),
        Some("T") => (12, 0),
        Some("P") => (15, 0),
        Some("E") => (18, 0),
        Some("Ki") => (0, 10),
        Some("Mi") => (0, 20),
        Some("Gi") => (0, 30),
        Some("Ti") => (0, 40),
        Some("Pi") => (0, 50),
        Some("Ei") => (0, 60),
        Some(unit) => return Err(Error::new(format!("Unknown quantity unit {unit} in {raw}"))),
    };
    let overflow = || Error::new(format!("Quantity is too large: {raw}"));
    // apply our binary unit first since it is always a multiplication
    let value = mantissa.checked_shl(twos).ok_or_else(overflow)?;
    if twos > 0 && value >> twos != mantissa {
        return Err(overflow());
    }
    // the fraction digits we folded into our mantissa lower the power of ten
    let power = exponent
        .saturating_add(tens)
        .saturating_add(scale)
        .saturating_sub(fraction.len() as i32);
    let scaled = if power >= 0 {
        10u128
            .checked_pow(power as u32)
            .and_then(|factor| value.checked_mul(factor))
            .ok_or_else(overflow)?
    } else {
        // divide and round up, anything past 10^38 rounds a nonzero value to 1
        match 10u128.checked_pow(power.unsigned_abs()) {
            Some(divisor) => value.div_ceil(divisor),
            None => u128::from(value > 0),
        }
    };
    u64::try_from(scaled).map_err(|_| overflow())
}

/// Converts a cpu quantity to millicpu, rounding up
///
/// # Arguments
///
/// * `raw` - Raw cpu value
pub fn cpu(raw: &str) -> Result<u64, Error> {
    quantity(raw, 3)
}

/// Converts a memory quantity to bytes, rounding up
///
/// # Arguments
///
/// * `raw` - Raw memory value
pub fn memory(raw: &str) -> Result<u64, Error> {
    quantity(raw, 0)
}

/// Generates a unique name for a balancing pod
///
/// # Arguments
///
/// * `prefix` - The prefix to put before our uuid
pub fn unique_name(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4())
}

/// Polls a check until it passes or our timeout expires
///
/// The check is run once immediately. Errors from the check are logged by the
/// caller's closure and treated as "not done yet" only if the closure maps them
/// to `Ok(false)`; returned errors stop the poll.
///
/// # Arguments
///
/// * `interval` - How long to wait between checks
/// * `timeout` - How long to keep checking for
/// * `waiting_for` - What we are waiting on, for error messages
/// * `check` - The check to run
pub async fn poll_until<F, Fut>(
    interval: Duration,
    timeout: Duration,
    waiting_for: &str,
    mut check: F,
) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
{
    // get the point at which we give up
    let deadline = Instant::now() + timeout;
    loop {
        // stop as soon as our check passes
        if check().await? {
            return Ok(());
        }
        // make sure we have time left for another check
        if Instant::now() + interval > deadline {
            return Err(Error::Timeout {
                waiting_for: waiting_for.to_owned(),
            });
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_quantities() {
        assert_eq!(cpu("100m").unwrap(), 100);
        assert_eq!(cpu("2").unwrap(), 2000);
        assert_eq!(cpu("1.5").unwrap(), 1500);
        assert_eq!(cpu("0.1").unwrap(), 100);
        assert_eq!(cpu("250u").unwrap(), 1);
        assert_eq!(cpu(".5").unwrap(), 500);
        assert!(cpu("two").is_err());
        assert!(cpu("").is_err());
        assert!(cpu(".").is_err());
    }

    #[test]
    fn memory_quantities() {
        assert_eq!(memory("100Mi").unwrap(), 104_857_600);
        assert_eq!(memory("4Gi").unwrap(), 4_294_967_296);
        assert_eq!(memory("1k").unwrap(), 1000);
        assert_eq!(memory("128974848").unwrap(), 128_974_848);
        assert_eq!(memory("129e6").unwrap(), 129_000_000);
        assert_eq!(memory("1E").unwrap(), 1_000_000_000_000_000_000);
        assert_eq!(memory("16310004Ki").unwrap(), 16_701_444_096);
        assert!(memory("12Xi").is_err());
    }

    #[test]
    fn quantities_parse_across_threads() {
        // every thread shares the same compiled pattern
        std::thread::scope(|scope| {
            let handles = (0..4)
                .map(|_| scope.spawn(|| (cpu("1.5").unwrap(), memory("16310004Ki").unwrap())))
                .collect::<Vec<_>>();
            for handle in handles {
                assert_eq!(handle.join().unwrap(), (1500, 16_701_444_096));
            }
        });
    }

    #[test]
    fn unique_names_do_not_collide() {
        let first = unique_name("balanced");
        let second = unique_name("balanced");
        assert!(first.starts_with("balanced-"));
        assert_ne!(first, second);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_times_out() {
        let attempt = poll_until(
            Duration::from_secs(2),
            Duration::from_secs(10),
            "nothing",
            || async { Ok::<bool, Error>(false) },
        )
        .await;
        assert!(matches!(attempt, Err(Error::Timeout { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_checks_immediately() {
        let mut checks = 0;
        poll_until(Duration::from_secs(2), Duration::from_secs(0), "once", || {
            checks += 1;
            async { Ok::<bool, Error>(true) }
        })
        .await
        .unwrap();
        assert_eq!(checks, 1);
    }
}
