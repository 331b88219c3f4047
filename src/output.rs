use deskmate::core::catalogue::IntentSummary;
use deskmate::core::journal::JournalEntry;
use deskmate::core::sandbox::SandboxExecutionResult;

pub struct Printer {
    pub use_color: bool,
}

impl Printer {
    pub fn new() -> Self {
        let use_color = supports_color::on(supports_color::Stream::Stdout).is_some();
        Self { use_color }
    }

    pub fn success(&self, message: &str) {
        self.print_prefix("[+]", "green", message);
    }

    pub fn error(&self, message: &str) {
        self.print_prefix("[-]", "red", message);
    }

    pub fn warning(&self, message: &str) {
        self.print_prefix("[!]", "yellow", message);
    }

    pub fn info(&self, message: &str) {
        self.print_prefix("[?]", "cyan", message);
    }

    pub fn header(&self, title: &str) {
        let rule = "─".repeat(title.chars().count());
        if self.use_color {
            println!("\n\x1b[1;36m{}\x1b[0m", title);
            println!("\x1b[90m{}\x1b[0m", rule);
        } else {
            println!("\n{}", title);
            println!("{}", rule);
        }
    }

    pub fn print_prefix(&self, prefix: &str, color: &str, message: &str) {
        if self.use_color {
            let color_code = match color {
                "green" => "\x1b[32m",
                "red" => "\x1b[31m",
                "yellow" => "\x1b[33m",
                "cyan" => "\x1b[36m",
                _ => "\x1b[0m",
            };
            println!("{}{}\x1b[0m {}", color_code, prefix, message);
        } else {
            println!("{} {}", prefix, message);
        }
    }

    pub fn print_key_value(&self, key: &str, value: &str, indent: usize) {
        let indent_str = " ".repeat(indent);
        if self.use_color {
            println!("{}\x1b[1m{}:\x1b[0m {}", indent_str, key, value);
        } else {
            println!("{}{}: {}", indent_str, key, value);
        }
    }

    pub fn print_list_item(&self, item: &str, indent: usize) {
        let indent_str = " ".repeat(indent);
        if self.use_color {
            println!("{}\x1b[36m•\x1b[0m {}", indent_str, item);
        } else {
            println!("{}• {}", indent_str, item);
        }
    }

    pub fn print_indented(&self, text: &str, indent: usize) {
        let indent_str = " ".repeat(indent);
        for line in text.lines() {
            println!("{}{}", indent_str, line);
        }
    }

    pub fn intents(&self, summaries: &[IntentSummary]) {
        self.header(&format!("Intents ({})", summaries.len()));
        for summary in summaries {
            self.print_list_item(&format!("{} [{}]: {}", summary.name, summary.category, summary.description), 0);
            for example in &summary.examples {
                self.print_indented(&format!("e.g. \"{}\"", example), 4);
            }
        }
    }

    pub fn code_result(&self, result: &SandboxExecutionResult) {
        if result.success {
            self.success(&format!("Code executed in {:.3}s", result.execution_time));
        } else {
            self.error(result.error.as_deref().unwrap_or("Code execution failed"));
        }
        if !result.output.is_empty() {
            self.print_indented(&result.output, 4);
        }
        if let Some(traceback) = &result.traceback {
            self.print_indented(traceback, 4);
        }
        for (name, value) in &result.variables {
            self.print_key_value(name, &value.to_string(), 2);
        }
        if let Some(value) = &result.return_value {
            self.print_key_value("=>", &value.to_string(), 2);
        }
    }

    pub fn journal_entries<'a>(&self, entries: impl IntoIterator<Item = &'a JournalEntry>) {
        for entry in entries {
            let status = if entry.success { "+" } else { "-" };
            let intent = entry.intent.as_deref().unwrap_or("-");
            println!(
                "  [{}] {} {:<18} {}",
                status,
                entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                intent,
                entry.utterance
            );
        }
    }
}
