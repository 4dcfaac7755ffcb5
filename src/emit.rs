use std::fmt;

/// Hard-tab indentation for a block nesting level.
pub(crate) fn tabs(level: usize) -> String {
    "\t".repeat(level)
}

/// Writes indented source lines to a caller-supplied text sink.
#[derive(Debug)]
pub(crate) struct Emitter<W> {
    sink: W,
    level: usize,
}

impl<W: fmt::Write> Emitter<W> {
    pub(crate) fn new(sink: W) -> Self {
        Self { sink, level: 0 }
    }

    /// Current block nesting level.
    pub(crate) fn level(&self) -> usize {
        self.level
    }

    pub(crate) fn indent(&mut self) {
        self.level += 1;
    }

    pub(crate) fn outdent(&mut self) {
        self.level = self.level.saturating_sub(1);
    }

    /// Write one line at the current indent.
    pub(crate) fn line(&mut self, text: &str) -> fmt::Result {
        for _ in 0..self.level {
            self.sink.write_char('\t')?;
        }
        self.sink.write_str(text)?;
        self.sink.write_char('\n')
    }

    /// Write a bare newline, without indentation.
    pub(crate) fn blank(&mut self) -> fmt::Result {
        self.sink.write_char('\n')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_carry_the_current_indent() {
        let mut out = String::new();
        let mut em = Emitter::new(&mut out);
        em.line("function f()").unwrap();
        em.line("{").unwrap();
        em.indent();
        em.line("return;").unwrap();
        em.outdent();
        em.line("}").unwrap();
        em.blank().unwrap();
        assert_eq!(out, "function f()\n{\n\treturn;\n}\n\n");
    }

    #[test]
    fn outdent_saturates_at_zero() {
        let mut out = String::new();
        let mut em = Emitter::new(&mut out);
        em.outdent();
        assert_eq!(em.level(), 0);
        em.line("x;").unwrap();
        assert_eq!(out, "x;\n");
    }
}
