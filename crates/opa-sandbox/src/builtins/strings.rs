//! printf-style string formatting.
//!
//! Implements the `sprintf` builtin over the specifier grammar
//! `%[index$][flags][width][.precision][length]type` with flags `#` (alternate
//! form), `-` (left justify), `+` (explicit sign), ` ` (space for sign) and
//! `'` (thousands grouping), zero padding via a leading `0` in the width,
//! `h`/`l` integer narrowing/widening, and types `d i o x X u c s f e E g G
//! p n %`. Malformed specifiers pass through verbatim.

use serde_json::Value;

/// `sprintf(format, args)` registry handler.
pub(crate) fn sprintf_builtin(args: &[Value]) -> Result<Value, String> {
    let format = args
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| "format template must be a string".to_string())?;
    let params = args
        .get(1)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[]);
    sprintf(format, params).map(Value::String)
}

/// Render `format`, drawing positional values from `args`.
pub fn sprintf(format: &str, args: &[Value]) -> Result<String, String> {
    let chars: Vec<char> = format.chars().collect();
    let mut out = String::with_capacity(format.len());
    let mut next_arg = 0usize;
    let mut i = 0usize;

    while i < chars.len() {
        if chars[i] != '%' {
            out.push(chars[i]);
            i += 1;
            continue;
        }
        match parse_spec(&chars, i) {
            Some((spec, end)) => {
                let written = out.chars().count();
                out.push_str(&render(&spec, args, &mut next_arg, written)?);
                i = end;
            }
            // not a specifier; emit the '%' and keep scanning
            None => {
                out.push('%');
                i += 1;
            }
        }
    }

    Ok(out)
}

#[derive(Debug, Default)]
struct Spec {
    /// 1-based explicit argument index (`%2$d`)
    index: Option<usize>,
    alternate: bool,
    left: bool,
    plus: bool,
    space: bool,
    group: bool,
    zero: bool,
    width: Option<usize>,
    precision: Option<usize>,
    length: Option<char>,
    kind: char,
}

/// Parse one specifier starting at the `%` at `chars[start]`.
///
/// Returns the parsed spec and the index just past it, or `None` when the
/// text does not form a specifier.
fn parse_spec(chars: &[char], start: usize) -> Option<(Spec, usize)> {
    let mut spec = Spec::default();
    let mut i = start + 1;

    // explicit argument index: digits followed by '$'
    let digits_start = i;
    while i < chars.len() && chars[i].is_ascii_digit() {
        i += 1;
    }
    if i > digits_start && i < chars.len() && chars[i] == '$' {
        spec.index = Some(parse_digits(&chars[digits_start..i]));
        i += 1;
    } else {
        // the digits, if any, were a field width
        i = digits_start;
    }

    while i < chars.len() {
        match chars[i] {
            '#' => spec.alternate = true,
            '-' => spec.left = true,
            '+' => spec.plus = true,
            ' ' => spec.space = true,
            '\'' => spec.group = true,
            _ => break,
        }
        i += 1;
    }
    // explicit + overrides space-for-sign
    if spec.plus {
        spec.space = false;
    }

    let width_start = i;
    while i < chars.len() && chars[i].is_ascii_digit() {
        i += 1;
    }
    if i > width_start {
        spec.zero = chars[width_start] == '0';
        spec.width = Some(parse_digits(&chars[width_start..i]));
    }

    if i < chars.len() && chars[i] == '.' {
        let prec_start = i + 1;
        let mut j = prec_start;
        while j < chars.len() && chars[j].is_ascii_digit() {
            j += 1;
        }
        if j == prec_start {
            return None;
        }
        spec.precision = Some(parse_digits(&chars[prec_start..j]));
        i = j;
    }

    if i < chars.len() && matches!(chars[i], 'h' | 'l') {
        spec.length = Some(chars[i]);
        i += 1;
    }

    let kind = *chars.get(i)?;
    if !"dioxXucsfeEgGpn%".contains(kind) {
        return None;
    }
    spec.kind = kind;
    Some((spec, i + 1))
}

fn parse_digits(digits: &[char]) -> usize {
    digits
        .iter()
        .fold(0usize, |acc, c| acc.saturating_mul(10) + (*c as usize - '0' as usize))
}

/// Numeric view of a JSON value.
#[derive(Debug, Clone, Copy)]
enum Num {
    Int(i64),
    UInt(u64),
    Float(f64),
}

impl Num {
    fn of(value: &Value) -> Option<Num> {
        if let Some(i) = value.as_i64() {
            Some(Num::Int(i))
        } else if let Some(u) = value.as_u64() {
            Some(Num::UInt(u))
        } else {
            value.as_f64().map(Num::Float)
        }
    }

    fn is_positive(&self) -> bool {
        match *self {
            Num::Int(i) => i >= 0,
            Num::UInt(_) => true,
            Num::Float(f) => f >= 0.0,
        }
    }

    fn as_f64(&self) -> f64 {
        match *self {
            Num::Int(i) => i as f64,
            Num::UInt(u) => u as f64,
            Num::Float(f) => f,
        }
    }
}

fn render(
    spec: &Spec,
    args: &[Value],
    next_arg: &mut usize,
    written: usize,
) -> Result<String, String> {
    // %% and %n consume no argument
    match spec.kind {
        '%' => return Ok("%".to_string()),
        'n' => {
            return render_decimal(Num::Int(written as i64), spec, spec.plus, spec.space);
        }
        _ => {}
    }

    let idx = match spec.index {
        Some(ix) => ix
            .checked_sub(1)
            .ok_or_else(|| "argument index must be 1-based".to_string())?,
        None => *next_arg,
    };
    *next_arg += 1;

    let value = args
        .get(idx)
        .ok_or_else(|| format!("missing argument {} for %{}", idx + 1, spec.kind))?;

    let value = apply_length(value, spec.length)?;

    match spec.kind {
        'd' | 'i' => match Num::of(&value) {
            Some(n) => render_decimal(n, spec, spec.plus, spec.space),
            None => Ok(String::new()),
        },
        'u' => match Num::of(&value) {
            Some(n) => render_decimal(to_unsigned(n), spec, false, false),
            None => Ok(String::new()),
        },
        'o' => match Num::of(&value) {
            Some(n) => Ok(render_octal(n, spec)),
            None => Ok(String::new()),
        },
        'x' => render_hex(&value, spec, false),
        'X' => render_hex(&value, spec, true),
        'c' => render_char(&value),
        's' => Ok(render_string(&value, spec)),
        'f' => match Num::of(&value) {
            Some(n) => render_fixed(n, spec),
            None => Ok(String::new()),
        },
        'e' | 'E' => match Num::of(&value) {
            Some(n) => {
                let prec = spec.precision.unwrap_or(6);
                let body = format_exponential(n.as_f64(), prec, spec.kind == 'E');
                decorate_number(body, n.is_positive(), spec, spec.plus, spec.space)
            }
            None => Ok(String::new()),
        },
        'g' | 'G' => match Num::of(&value) {
            Some(n) => {
                let prec = spec.precision.unwrap_or(6);
                let body = format_general(n.as_f64(), prec, spec.kind == 'G');
                decorate_number(body, n.is_positive(), spec, spec.plus, spec.space)
            }
            None => Ok(String::new()),
        },
        // no host pointers exist for JSON values
        'p' => Ok(String::new()),
        other => Err(format!("unsupported specifier %{}", other)),
    }
}

/// `h` narrows to 16 bits, `l` widens; both reject non-integer values.
fn apply_length(value: &Value, length: Option<char>) -> Result<Value, String> {
    let Some(length) = length else {
        return Ok(value.clone());
    };
    match (length, Num::of(value)) {
        ('h', Some(Num::Int(i))) => Ok(Value::from((i as i16) as i64)),
        ('h', Some(Num::UInt(u))) => Ok(Value::from((u as u16) as u64)),
        ('l', Some(Num::Int(i))) => Ok(Value::from(i)),
        ('l', Some(Num::UInt(u))) => Ok(Value::from(u)),
        (l, _) => Err(format!("cannot apply %{} to {}", l, type_name(value))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn render_decimal(num: Num, spec: &Spec, plus: bool, space: bool) -> Result<String, String> {
    let body = match num {
        Num::Int(i) => i.to_string(),
        Num::UInt(u) => u.to_string(),
        Num::Float(_) => return Err("cannot format a float as a decimal integer".to_string()),
    };
    let body = if spec.group { group_thousands(&body) } else { body };
    decorate_number(body, num.is_positive(), spec, plus, space)
}

fn render_fixed(num: Num, spec: &Spec) -> Result<String, String> {
    let prec = spec.precision.unwrap_or(6);
    let body = format!("{:.*}", prec, num.as_f64());
    let body = if spec.group { group_thousands(&body) } else { body };
    decorate_number(body, num.is_positive(), spec, spec.plus, spec.space)
}

fn render_octal(num: Num, spec: &Spec) -> String {
    let long = match num {
        Num::Int(i) => i,
        Num::UInt(u) => u as i64,
        Num::Float(f) => f.round() as i64,
    };
    let body = format!("{:o}", long);
    let needs_prefix = spec.alternate && body != "0";

    if spec.left || !spec.zero {
        let w = if needs_prefix { format!("0{}", body) } else { body };
        justify(w, spec.width, spec.left, ' ')
    } else {
        // zero-padded, right-justified
        let reserve = usize::from(needs_prefix);
        let target = spec.width.unwrap_or(0).saturating_sub(reserve);
        let w = pad_left(body, target, '0');
        if needs_prefix {
            format!("0{}", w)
        } else {
            w
        }
    }
}

fn render_hex(value: &Value, spec: &Spec, upper: bool) -> Result<String, String> {
    let body = match Num::of(value) {
        Some(Num::Int(i)) => format!("{:x}", i),
        Some(Num::UInt(u)) => format!("{:x}", u),
        Some(Num::Float(_)) => return Err("cannot format a float as hex".to_string()),
        None => return Ok(String::new()),
    };
    let mut body = if upper { body.to_uppercase() } else { body };
    if let Some(prec) = spec.precision {
        body = pad_left(body, prec, '0');
    }
    let prefix = match (spec.alternate, upper) {
        (false, _) => "",
        (true, false) => "0x",
        (true, true) => "0X",
    };

    if spec.left || !spec.zero {
        Ok(justify(
            format!("{}{}", prefix, body),
            spec.width,
            spec.left,
            ' ',
        ))
    } else {
        let target = spec.width.unwrap_or(0).saturating_sub(prefix.len());
        Ok(format!("{}{}", prefix, pad_left(body, target, '0')))
    }
}

fn render_char(value: &Value) -> Result<String, String> {
    match Num::of(value) {
        Some(Num::Int(i)) if (0..=0x10FFFF).contains(&i) => {
            char::from_u32(i as u32)
                .map(|c| c.to_string())
                .ok_or_else(|| format!("{} is not a valid character code", i))
        }
        Some(Num::UInt(u)) if u <= 0x10FFFF => char::from_u32(u as u32)
            .map(|c| c.to_string())
            .ok_or_else(|| format!("{} is not a valid character code", u)),
        Some(Num::Float(_)) => Err("cannot format a float as a character".to_string()),
        Some(_) => Err("character code out of range".to_string()),
        None => Ok(value
            .as_str()
            .and_then(|s| s.chars().next())
            .map(|c| c.to_string())
            .unwrap_or_default()),
    }
}

fn render_string(value: &Value, spec: &Spec) -> String {
    let mut s = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if let Some(prec) = spec.precision {
        s = s.chars().take(prec).collect();
    }
    let pad = if spec.zero && !spec.left { '0' } else { ' ' };
    justify(s, spec.width, spec.left, pad)
}

/// Width padding and sign decoration shared by every numeric form.
///
/// Zero padding reserves the leading column for the sign (or one more pad
/// character), so `%05d` of 42 is `00042` and of -42 is `-0042`.
fn decorate_number(
    body: String,
    positive: bool,
    spec: &Spec,
    plus: bool,
    space: bool,
) -> Result<String, String> {
    if spec.left || !spec.zero {
        let mut s = body;
        if positive {
            if plus {
                s.insert(0, '+');
            } else if space {
                s.insert(0, ' ');
            }
        }
        Ok(justify(s, spec.width, spec.left, ' '))
    } else {
        let mut s = body;
        let negative = s.starts_with('-');
        if negative {
            s.remove(0);
        }
        if let Some(width) = spec.width {
            s = pad_left(s, width.saturating_sub(1), '0');
        }
        let sign = if negative {
            "-"
        } else if plus {
            "+"
        } else if space {
            " "
        } else if spec.width.is_some() {
            "0"
        } else {
            ""
        };
        Ok(format!("{}{}", sign, s))
    }
}

fn justify(s: String, width: Option<usize>, left: bool, pad: char) -> String {
    let Some(width) = width else {
        return s;
    };
    let len = s.chars().count();
    if len >= width {
        return s;
    }
    let fill: String = std::iter::repeat(pad).take(width - len).collect();
    if left {
        format!("{}{}", s, fill)
    } else {
        format!("{}{}", fill, s)
    }
}

fn pad_left(s: String, width: usize, pad: char) -> String {
    let len = s.chars().count();
    if len >= width {
        return s;
    }
    let fill: String = std::iter::repeat(pad).take(width - len).collect();
    format!("{}{}", fill, s)
}

fn to_unsigned(num: Num) -> Num {
    match num {
        Num::Int(i) => Num::UInt(i as u64),
        Num::UInt(u) => Num::UInt(u),
        Num::Float(f) => Num::UInt(f as u64),
    }
}

/// Insert `,` every three digits of the integer part.
fn group_thousands(body: &str) -> String {
    let (sign, rest) = match body.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", body),
    };
    let (int_part, frac_part) = match rest.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (rest, None),
    };

    let digits: Vec<char> = int_part.chars().collect();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (pos, c) in digits.iter().enumerate() {
        if pos > 0 && (digits.len() - pos) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(*c);
    }

    match frac_part {
        Some(f) => format!("{}{}.{}", sign, grouped, f),
        None => format!("{}{}", sign, grouped),
    }
}

/// C-style scientific notation: `d.dddddd` mantissa, sign and at least two
/// exponent digits.
fn format_exponential(v: f64, precision: usize, upper: bool) -> String {
    let s = format!("{:.*e}", precision, v);
    let Some((mantissa, exp)) = s.split_once('e') else {
        // inf and nan carry no exponent
        return s;
    };
    let exp: i32 = exp.parse().unwrap_or(0);
    let marker = if upper { 'E' } else { 'e' };
    let sign = if exp < 0 { '-' } else { '+' };
    format!("{}{}{}{:02}", mantissa, marker, sign, exp.abs())
}

/// General form: fixed or scientific, whichever is shorter by the C rules,
/// with trailing zeros removed.
fn format_general(v: f64, precision: usize, upper: bool) -> String {
    let p = precision.max(1);
    if v == 0.0 {
        return "0".to_string();
    }
    let exp = v.abs().log10().floor() as i32;
    if exp < -4 || exp >= p as i32 {
        let s = format_exponential(v, p - 1, upper);
        let marker = if upper { 'E' } else { 'e' };
        match s.split_once(marker) {
            Some((mantissa, exponent)) => {
                format!("{}{}{}", strip_trailing_zeros(mantissa), marker, exponent)
            }
            None => s,
        }
    } else {
        let decimals = (p as i32 - 1 - exp).max(0) as usize;
        strip_trailing_zeros(&format!("{:.*}", decimals, v)).to_string()
    }
}

fn strip_trailing_zeros(s: &str) -> &str {
    if !s.contains('.') {
        return s;
    }
    s.trim_end_matches('0').trim_end_matches('.')
}
