use chrono::{DateTime, Local};

/// ESC/POS Commands (byte sequences)
const ESC: u8 = 0x1b;
const GS: u8 = 0x1d;
const LF: u8 = 0x0a;
const CR: u8 = 0x0d;

/// Characters per line for the supported paper rolls
#[derive(Debug, Clone, Copy)]
pub enum PaperWidth {
    Width58mm = 32,
    Width80mm = 48,
}

#[derive(Debug, Clone, Copy)]
pub enum Alignment {
    Left = 0,
    Center = 1,
    Right = 2,
}

#[derive(Debug, Clone, Copy)]
pub enum TextSize {
    Normal = 0x00,
    DoubleWidth = 0x10,
    DoubleHeight = 0x20,
    DoubleBoth = 0x30,
}

/// ESC/POS Command Builder
///
/// Only used for agent-generated tickets. Job payloads from the cloud are
/// already rendered and go to the printer untouched.
pub struct ESCPOSBuilder {
    buffer: Vec<u8>,
    paper_width: PaperWidth,
}

impl ESCPOSBuilder {
    pub fn new(paper_width: PaperWidth) -> Self {
        Self {
            buffer: Vec::new(),
            paper_width,
        }
    }

    pub fn build(self) -> Vec<u8> {
        self.buffer
    }

    /// Initialize printer
    pub fn initialize(&mut self) -> &mut Self {
        self.buffer.extend_from_slice(&[ESC, 0x40]);
        self
    }

    pub fn text(&mut self, text: &str) -> &mut Self {
        self.buffer.extend_from_slice(text.as_bytes());
        self
    }

    pub fn feed(&mut self, lines: u8) -> &mut Self {
        for _ in 0..lines {
            self.buffer.push(LF);
        }
        self
    }

    pub fn new_line(&mut self) -> &mut Self {
        self.buffer.extend_from_slice(&[CR, LF]);
        self
    }

    pub fn align(&mut self, alignment: Alignment) -> &mut Self {
        self.buffer.extend_from_slice(&[ESC, 0x61, alignment as u8]);
        self
    }

    pub fn size(&mut self, size: TextSize) -> &mut Self {
        self.buffer.extend_from_slice(&[GS, 0x21, size as u8]);
        self
    }

    pub fn bold(&mut self, enabled: bool) -> &mut Self {
        self.buffer.extend_from_slice(&[ESC, 0x45, if enabled { 1 } else { 0 }]);
        self
    }

    /// Horizontal rule across the full paper width
    pub fn draw_line(&mut self, char: char) -> &mut Self {
        let line: String = char.to_string().repeat(self.paper_width as usize);
        self.text(&line).new_line()
    }

    /// Feed then cut (full or partial)
    pub fn cut(&mut self, partial: bool) -> &mut Self {
        self.feed(3);
        self.buffer.extend_from_slice(&[GS, 0x56, if partial { 1 } else { 0 }]);
        self
    }
}

/// Connectivity test ticket stamped with the current local time.
pub fn build_test_ticket(store_name: &str) -> Vec<u8> {
    build_test_ticket_at(store_name, Local::now())
}

/// Test ticket for a fixed timestamp: same inputs, same bytes.
pub fn build_test_ticket_at(store_name: &str, printed_at: DateTime<Local>) -> Vec<u8> {
    let mut builder = ESCPOSBuilder::new(PaperWidth::Width58mm);
    let store = if store_name.trim().is_empty() {
        "Store"
    } else {
        store_name.trim()
    };

    builder
        .initialize()
        .align(Alignment::Center)
        .size(TextSize::DoubleBoth)
        .bold(true)
        .text("TEST PRINT")
        .new_line()
        .size(TextSize::Normal)
        .bold(false)
        .draw_line('-')
        .text(store)
        .new_line()
        .text(&printed_at.format("%d/%m/%Y %H:%M:%S").to_string())
        .new_line()
        .draw_line('-')
        .text("Printer connected successfully")
        .new_line()
        .align(Alignment::Left)
        .feed(1)
        .cut(false);

    builder.build()
}
