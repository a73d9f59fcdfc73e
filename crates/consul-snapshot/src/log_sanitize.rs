//! Terminal-safe rendering of text that comes from other processes or remote
//! peers (agent output, HTTP error bodies, CLI stderr) before it is logged.

const MAX_LOG_CHARS: usize = 4096;

enum EscapeMode {
    Esc,
    Csi,
    Osc,
    OscEsc,
    StTerminated,
    StEsc,
}

pub fn sanitize_log_line(input: &str) -> String {
    excerpt(input, MAX_LOG_CHARS)
}

/// Strip escape sequences and control characters, keeping at most `max_chars`.
pub fn excerpt(input: &str, max_chars: usize) -> String {
    let mut out = String::with_capacity(input.len().min(max_chars));
    let mut esc_mode: Option<EscapeMode> = None;
    let mut truncated = false;
    let mut char_count = 0usize;

    for c in input.chars() {
        if let Some(mode) = esc_mode.as_ref() {
            match mode {
                EscapeMode::Esc => match c {
                    '[' => esc_mode = Some(EscapeMode::Csi),
                    ']' => esc_mode = Some(EscapeMode::Osc),
                    'P' | 'X' | '^' | '_' => esc_mode = Some(EscapeMode::StTerminated),
                    _ => esc_mode = None,
                },
                EscapeMode::Csi => {
                    if ('@'..='~').contains(&c) {
                        esc_mode = None;
                    }
                }
                EscapeMode::Osc => {
                    if c == '\x07' {
                        esc_mode = None;
                    } else if c == '\x1b' {
                        esc_mode = Some(EscapeMode::OscEsc);
                    }
                }
                EscapeMode::OscEsc => {
                    if c == '\\' {
                        esc_mode = None;
                    } else if c != '\x1b' {
                        esc_mode = Some(EscapeMode::Osc);
                    }
                }
                EscapeMode::StTerminated => {
                    if c == '\x1b' {
                        esc_mode = Some(EscapeMode::StEsc);
                    }
                }
                EscapeMode::StEsc => {
                    if c == '\\' {
                        esc_mode = None;
                    } else if c != '\x1b' {
                        esc_mode = Some(EscapeMode::StTerminated);
                    }
                }
            }
            continue;
        }

        if c == '\x1b' {
            esc_mode = Some(EscapeMode::Esc);
            continue;
        }
        if c == '\r' || c == '\n' {
            continue;
        }
        let shown = if c == '\t' {
            ' '
        } else if c.is_control() || is_format_control(c) {
            continue;
        } else {
            c
        };
        if char_count >= max_chars {
            truncated = true;
            break;
        }
        out.push(shown);
        char_count += 1;
    }

    if truncated {
        out.push_str(" ...[truncated]");
    }

    out
}

fn is_format_control(c: char) -> bool {
    c == '\u{061C}'
        || c == '\u{200E}'
        || c == '\u{200F}'
        || ('\u{202A}'..='\u{202E}').contains(&c)
        || ('\u{2066}'..='\u{2069}').contains(&c)
}
