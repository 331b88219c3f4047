use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::path::PathBuf;

use crate::output::Printer;

pub struct Repl {
    editor: DefaultEditor,
    history_file: PathBuf,
    printer: Printer,
}

impl Repl {
    pub fn new(history_file: PathBuf) -> Result<Self, String> {
        let mut editor =
            DefaultEditor::new().map_err(|e| format!("Failed to initialize line editor: {}", e))?;

        if let Some(dir) = history_file.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|e| format!("Failed to create {}: {}", dir.display(), e))?;
        }
        if history_file.exists() {
            editor.load_history(&history_file).ok();
        }

        Ok(Self {
            editor,
            history_file,
            printer: Printer::new(),
        })
    }

    /// One logical input. A line opening a ``` fence keeps reading until the
    /// closing fence; a line ending in ':' keeps reading until `;;`.
    /// `Ok(None)` means nothing to do (blank line or Ctrl-C); EOF is
    /// reported as `Err(ReadlineError::Eof)`.
    pub fn read_line(&mut self, prompt: &str) -> Result<Option<String>, ReadlineError> {
        let mut input_lines: Vec<String> = Vec::new();
        let mut mode = Multiline::Off;

        loop {
            let current_prompt = if mode == Multiline::Off { prompt } else { "... " };

            match self.editor.readline(current_prompt) {
                Ok(line) => {
                    let trimmed = line.trim_end();

                    match mode {
                        Multiline::Off => {
                            if trimmed.is_empty() {
                                return Ok(None);
                            }
                            mode = multiline_start(trimmed);
                            if mode == Multiline::Off {
                                self.editor.add_history_entry(&line)?;
                                return Ok(Some(line));
                            }
                            input_lines.push(line);
                        }
                        Multiline::Fence => {
                            input_lines.push(line.clone());
                            if trimmed.contains("```") {
                                return self.finish(&input_lines);
                            }
                        }
                        Multiline::Block => {
                            if trimmed.trim() == ";;" {
                                return self.finish(&input_lines);
                            }
                            input_lines.push(line);
                        }
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    if mode != Multiline::Off {
                        println!("^C - Cancelled multi-line input");
                    }
                    return Ok(None);
                }
                Err(ReadlineError::Eof) if mode != Multiline::Off => {
                    return self.finish(&input_lines);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Single yes/no answer; anything but y/yes is a no.
    pub fn confirm(&mut self, question: &str) -> bool {
        match self.editor.readline(&format!("{} [y/N] ", question)) {
            Ok(answer) => matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"),
            Err(_) => false,
        }
    }

    fn finish(&mut self, lines: &[String]) -> Result<Option<String>, ReadlineError> {
        let full_input = lines.join("\n");
        if full_input.trim().is_empty() {
            return Ok(None);
        }
        self.editor.add_history_entry(&full_input)?;
        Ok(Some(full_input))
    }

    pub fn save_history(&mut self) -> Result<(), String> {
        self.editor
            .save_history(&self.history_file)
            .map_err(|e| format!("Failed to save REPL history: {}", e))
    }

    pub fn printer(&self) -> &Printer {
        &self.printer
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Multiline {
    Off,
    Fence,
    Block,
}

fn multiline_start(line: &str) -> Multiline {
    let fences = line.matches("```").count();
    if fences % 2 == 1 {
        Multiline::Fence
    } else if line.ends_with(':') {
        Multiline::Block
    } else {
        Multiline::Off
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multiline_start() {
        assert_eq!(multiline_start("run this code: ```python"), Multiline::Fence);
        assert_eq!(multiline_start("```print(1)```"), Multiline::Off);
        assert_eq!(multiline_start("run this code:"), Multiline::Block);
        assert_eq!(multiline_start("open calculator"), Multiline::Off);
    }
}
