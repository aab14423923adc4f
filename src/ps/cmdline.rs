// src/ps/cmdline.rs

//! Splits a Windows command line into its argument vector using the same
//! quoting rules as `CommandLineToArgvW`:
//!
//! * whitespace separates arguments outside quotes;
//! * `2n` backslashes before a quote yield `n` backslashes and toggle quoting;
//! * `2n+1` backslashes before a quote yield `n` backslashes and a literal quote;
//! * backslashes not followed by a quote are literal.

pub fn split(comm: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut cur = String::new();
    let mut in_arg = false;
    let mut quoted = false;
    let mut chars = comm.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                let mut slashes = 1;
                while chars.peek() == Some(&'\\') {
                    chars.next();
                    slashes += 1;
                }
                in_arg = true;
                if chars.peek() == Some(&'"') {
                    cur.extend(std::iter::repeat_n('\\', slashes / 2));
                    if slashes % 2 == 1 {
                        chars.next();
                        cur.push('"');
                    }
                } else {
                    cur.extend(std::iter::repeat_n('\\', slashes));
                }
            }
            '"' => {
                in_arg = true;
                // "" inside quotes is a literal quote
                if quoted && chars.peek() == Some(&'"') {
                    chars.next();
                    cur.push('"');
                } else {
                    quoted = !quoted;
                }
            }
            c if c.is_whitespace() && !quoted => {
                if in_arg {
                    args.push(std::mem::take(&mut cur));
                    in_arg = false;
                }
            }
            c => {
                in_arg = true;
                cur.push(c);
            }
        }
    }
    if in_arg {
        args.push(cur);
    }
    args
}
