const KIB: u64 = 1 << 10;
const MIB: u64 = 1 << 20;
const GIB: u64 = 1 << 30;

/// Parse a memory size such as `512MiB`, `2G` or `1048576`.
///
/// A bare number below one mebibyte is taken to be in mebibytes.
pub fn parse_size(arg: &str) -> Result<u64, String> {
    let arg = arg.trim();
    let split = arg
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(arg.len());
    let (digits, unit) = arg.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("'{arg}' is not a size"))?;

    let multiplier = match unit.trim().to_ascii_lowercase().as_str() {
        "" if value < MIB => MIB,
        "" | "b" => 1,
        "k" | "kib" => KIB,
        "m" | "mib" => MIB,
        "g" | "gib" => GIB,
        other => return Err(format!("unknown unit '{other}' in '{arg}'")),
    };
    match value.checked_mul(multiplier) {
        Some(0) => Err("the size must be positive".to_string()),
        Some(bytes) => Ok(bytes),
        None => Err(format!("'{arg}' is too large")),
    }
}
