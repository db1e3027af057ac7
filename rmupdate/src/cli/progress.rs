// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    collections::VecDeque,
    io::{self, IsTerminal, Write},
    time::{Duration, Instant},
};

// Speed is a simple moving average over 5 seconds.
const AVG_INTERVAL: Duration = Duration::from_millis(100);
const AVG_WINDOW_SIZE: usize = 5000 / AVG_INTERVAL.as_millis() as usize;

const RENDER_INTERVAL: Duration = Duration::from_millis(250);

/// A writer wrapper that renders the number of bytes written so far to stderr.
/// Nothing is rendered if stderr is not a terminal.
pub struct ProgressWriter<W> {
    inner: W,
    current: u64,
    total: u64,
    enabled: bool,
    last_render: Instant,
    avg: VecDeque<(Instant, u64)>,
}

impl<W: Write> ProgressWriter<W> {
    pub fn new(inner: W, total: u64) -> Self {
        Self {
            inner,
            current: 0,
            total,
            enabled: io::stderr().is_terminal(),
            last_render: Instant::now() - RENDER_INTERVAL,
            avg: VecDeque::new(),
        }
    }

    fn update(&mut self) {
        let now = Instant::now();

        if self
            .avg
            .back()
            .is_none_or(|(last, _)| now - *last > AVG_INTERVAL)
        {
            if self.avg.len() == AVG_WINDOW_SIZE {
                self.avg.pop_front();
            }

            self.avg.push_back((now, self.current));
        }

        if self.enabled && now - self.last_render > RENDER_INTERVAL {
            self.render();
            self.last_render = now;
        }
    }

    /// Speed in bytes per second over the averaging window.
    fn speed(&self) -> f64 {
        let (Some(front), Some(back)) = (self.avg.front(), self.avg.back()) else {
            return 0.0;
        };

        let duration = back.0 - front.0;
        if duration.is_zero() {
            0.0
        } else {
            (back.1 - front.1) as f64 / duration.as_secs_f64()
        }
    }

    fn render(&self) {
        let current_mib = self.current as f64 / 1024.0 / 1024.0;
        let total_mib = self.total as f64 / 1024.0 / 1024.0;
        let speed_mib_s = self.speed() / 1024.0 / 1024.0;

        eprint!("\x1b[2K\r{current_mib:.1} / {total_mib:.1} MiB ({speed_mib_s:.1} MiB/s)");
    }

    /// Render the final state and move to the next line.
    pub fn finish(self) -> W {
        if self.enabled {
            self.render();
            eprintln!();
        }

        self.inner
    }
}

impl<W: Write> Write for ProgressWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.current += n as u64;
        self.update();
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
