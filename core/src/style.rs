use colored::{Color, ColoredString, Colorize};
use crossterm::terminal;
use strum::IntoEnumIterator;

use crate::report::SessionSummary;
use crate::testing::{ProcessOutput, RunResult, Verdict};

#[macro_export]
macro_rules! print_success {
    ($fmt:literal, $($e:tt)*) => {
        use ::colored::Colorize as _;
        println!("{}", format!($fmt, $($e)*).green())
    }
}

pub fn is_truecolor_supported() -> bool {
    let Ok(v) = std::env::var("COLORTERM") else {
        return false
    };
    matches!(v.as_str(), "truecolor" | "24bit")
}

pub trait ColorTheme {
    fn color(&self) -> Color;
}

impl ColorTheme for Verdict {
    fn color(&self) -> Color {
        use Verdict::*;
        if !self::is_truecolor_supported() {
            return match self {
                Pass => Color::Green,
                Fail => Color::Yellow,
                Timeout => Color::Red,
                Error => Color::Magenta,
            };
        }

        match self {
            Pass => Color::TrueColor {
                r: 30,
                g: 180,
                b: 40,
            },
            Fail => Color::TrueColor {
                r: 210,
                g: 138,
                b: 4,
            },
            Timeout => Color::TrueColor {
                r: 220,
                g: 42,
                b: 42,
            },
            Error => Color::TrueColor {
                r: 171,
                g: 40,
                b: 200,
            },
        }
    }
}

pub fn verdict_badge(verdict: Verdict) -> ColoredString {
    let fg = if is_truecolor_supported() {
        Color::TrueColor {
            r: 255,
            g: 255,
            b: 255,
        }
    } else {
        Color::BrightBlack
    };
    format!(" {:<7} ", verdict)
        .on_color(verdict.color())
        .bold()
        .color(fg)
}

/// One-line summary over every session of a run.
pub fn print_run_summary(sessions: &[SessionSummary]) {
    let bar = "-".repeat(5);
    print!("{} ", bar);

    let mut total = SessionSummary::new("all");
    for s in sessions {
        for v in Verdict::iter() {
            for _ in 0..s.count(v) {
                total.record(v);
            }
        }
    }

    if total.all_passed() {
        let msg = format!("All {} cases passed", total.total);
        print!("{}", msg.green());
    } else {
        let summary_msg = if total.passed > 0 {
            format!("{}/{} cases failed", total.failures(), total.total)
        } else {
            format!("All {} cases failed", total.total)
        };

        let detail_msg = Verdict::iter()
            .filter(|&v| v != Verdict::Pass && total.count(v) > 0)
            .map(|v| {
                format!(
                    "{}{}{}",
                    self::verdict_badge(v),
                    "x".dimmed(),
                    total.count(v).to_string().bold().bright_white(),
                )
            })
            .collect::<Vec<String>>()
            .join(", ");

        print!("{} ({})", summary_msg.bright_red(), detail_msg);
    }

    println!(" {}", bar);
}

pub fn print_result_detail(res: &RunResult) {
    let (cols, _) = terminal::size().unwrap_or((40, 40));
    let cols = cols as usize;

    const BOLD_LINE: &str = "━";
    const THIN_LINE: &str = "─";

    let bold_bar = BOLD_LINE.repeat(cols).blue().bold();

    println!(
        "\n{} {}: {} [{}ms]\n{}",
        res.suite.bright_black(),
        res.case_name.color(Color::BrightYellow).bold(),
        self::verdict_badge(res.verdict),
        res.duration.as_millis(),
        bold_bar,
    );

    if let Some(failure) = &res.failure {
        println!("{} {}", failure.kind.to_string().bright_red().bold(), failure.reason);
    }

    fn print_sub_title(s: &str, cols: usize) {
        println!(
            "{}{}",
            s.cyan().bold(),
            THIN_LINE.repeat(cols.saturating_sub(s.len() + 1)).bright_black(),
        )
    }

    fn print_output(role: &str, out: &Option<ProcessOutput>, cols: usize) {
        let Some(out) = out else {
            print_sub_title(&format!("[{}: not started]", role), cols);
            return
        };
        let exit = out
            .exit
            .map_or_else(|| "none".to_owned(), |c| c.to_string());
        print_sub_title(&format!("[{} exit={}]", role, exit), cols);
        for (name, text) in [("stdout", &out.stdout), ("stderr", &out.stderr)] {
            if text.is_empty() {
                continue;
            }
            println!("{}", format!("({})", name).dimmed());
            print!("{}", text);
            if !text.ends_with('\n') {
                println!();
            }
        }
        if out.truncated {
            println!("{}", "<output truncated>".magenta().dimmed());
        }
    }

    print_output("server", &res.server_output, cols);
    print_output("client", &res.client_output, cols);

    println!("{}", bold_bar);
}
