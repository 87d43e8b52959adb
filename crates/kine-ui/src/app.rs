// crates/kine-ui/src/app.rs
//
// The UI task: owns the window, runs the presenter tick every repaint,
// uploads new frames as textures, overlays subtitles and the status
// line, and maps keyboard/mouse input onto the session's controls.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use egui::{Color32, ColorImage, Key, Pos2, Rect, Sense, TextureHandle, TextureOptions};

use kine_core::sync::REFRESH_RATE;
use kine_media::{PlayerEvent, Session, StreamKind, VideoFrame};

use crate::video::{idle_budget, Presenter};

/// Seek steps in seconds: arrows left/right and up/down.
const SEEK_STEP_SMALL: f64 = 10.0;
const SEEK_STEP_BIG: f64 = 60.0;
const VOLUME_STEP: i32 = 5;

pub struct KineApp {
    session:     Session,
    presenter:   Presenter,
    texture:     Option<TextureHandle>,
    /// Frame behind `texture`, kept for geometry (sar, flip) at paint.
    current:     Option<std::sync::Arc<VideoFrame>>,
    fullscreen:  bool,
    interrupted: &'static AtomicBool,
}

impl KineApp {
    pub fn new(session: Session, interrupted: &'static AtomicBool) -> Self {
        Self {
            session,
            presenter: Presenter::new(),
            texture: None,
            current: None,
            fullscreen: false,
            interrupted,
        }
    }

    fn handle_keys(&mut self, ctx: &egui::Context) {
        let pressed = |k: Key| ctx.input(|i| i.key_pressed(k));

        if pressed(Key::Q) || pressed(Key::Escape) {
            ctx.send_viewport_cmd(egui::ViewportCommand::Close);
        }
        if pressed(Key::Space) || pressed(Key::P) {
            self.session.toggle_pause();
        }
        if pressed(Key::M) {
            self.session.toggle_mute();
        }
        if pressed(Key::S) {
            self.session.step_frame();
        }
        if pressed(Key::Num0) {
            self.session.bump_volume(VOLUME_STEP);
        }
        if pressed(Key::Num9) {
            self.session.bump_volume(-VOLUME_STEP);
        }
        if pressed(Key::A) {
            self.session.cycle_stream(StreamKind::Audio);
        }
        if pressed(Key::V) {
            self.session.cycle_stream(StreamKind::Video);
        }
        if pressed(Key::T) {
            self.session.cycle_stream(StreamKind::Subtitle);
        }
        if pressed(Key::C) {
            self.session.cycle_program();
        }
        if pressed(Key::W) {
            self.session.cycle_video_filter();
        }
        if pressed(Key::F) {
            self.toggle_fullscreen(ctx);
        }
        if pressed(Key::ArrowLeft) {
            self.session.seek_by(-SEEK_STEP_SMALL);
        }
        if pressed(Key::ArrowRight) {
            self.session.seek_by(SEEK_STEP_SMALL);
        }
        if pressed(Key::ArrowUp) {
            self.session.seek_by(SEEK_STEP_BIG);
        }
        if pressed(Key::ArrowDown) {
            self.session.seek_by(-SEEK_STEP_BIG);
        }
        if pressed(Key::PageUp) {
            self.session.seek_chapter(1);
        }
        if pressed(Key::PageDown) {
            self.session.seek_chapter(-1);
        }
    }

    fn toggle_fullscreen(&mut self, ctx: &egui::Context) {
        self.fullscreen = !self.fullscreen;
        ctx.send_viewport_cmd(egui::ViewportCommand::Fullscreen(self.fullscreen));
    }

    fn upload(&mut self, ctx: &egui::Context, frame: &std::sync::Arc<VideoFrame>) {
        if !frame.is_uploaded() {
            let img = ColorImage::from_rgba_unmultiplied(
                [frame.width as usize, frame.height as usize],
                &frame.data,
            );
            match &mut self.texture {
                Some(t) => t.set(img, TextureOptions::LINEAR),
                None => self.texture = Some(ctx.load_texture("video", img, TextureOptions::LINEAR)),
            }
            frame.mark_uploaded();
        }
        self.current = Some(std::sync::Arc::clone(frame));
    }

    fn paint_video(&mut self, ui: &mut egui::Ui) {
        let panel = ui.max_rect();
        let response = ui.allocate_rect(panel, Sense::click_and_drag());

        // Left double-click: fullscreen. Right click/drag: seek to the
        // fractional position under the pointer.
        if response.double_clicked() {
            let ctx = ui.ctx().clone();
            self.toggle_fullscreen(&ctx);
        }
        let right_seek = response.secondary_clicked()
            || (response.dragged_by(egui::PointerButton::Secondary));
        if right_seek {
            if let Some(pos) = response.interact_pointer_pos() {
                let frac = ((pos.x - panel.min.x) / panel.width().max(1.0)) as f64;
                self.session.seek_to_fraction(frac);
            }
        }

        let painter = ui.painter();
        painter.rect_filled(panel, 0.0, Color32::BLACK);

        let (Some(tex), Some(frame)) = (&self.texture, &self.current) else {
            return;
        };
        // Aspect-correct letterbox around the display size.
        let ratio = frame.display_width() as f32 / frame.height.max(1) as f32;
        let (w, h) = {
            let w = panel.width();
            let h = w / ratio;
            if h <= panel.height() {
                (w, h)
            } else {
                (panel.height() * ratio, panel.height())
            }
        };
        let rect = Rect::from_center_size(panel.center(), egui::vec2(w, h));
        let uv = if frame.flip_v {
            Rect::from_min_max(Pos2::new(0.0, 1.0), Pos2::new(1.0, 0.0))
        } else {
            Rect::from_min_max(Pos2::ZERO, Pos2::new(1.0, 1.0))
        };
        painter.image(tex.id(), rect, uv, Color32::WHITE);
    }

    fn paint_subtitle(&self, ui: &egui::Ui) {
        let Some(sp) = self.presenter.current_subtitle(self.session.shared()) else {
            return;
        };
        let panel = ui.max_rect();
        let painter = ui.painter();
        let mut y = panel.max.y - 60.0;
        for rect in sp.rects.iter().rev() {
            let Some(text) = &rect.text else { continue };
            let pos = Pos2::new(panel.center().x, y);
            painter.text(
                pos + egui::vec2(1.0, 1.0),
                egui::Align2::CENTER_BOTTOM,
                text,
                egui::FontId::proportional(22.0),
                Color32::BLACK,
            );
            painter.text(
                pos,
                egui::Align2::CENTER_BOTTOM,
                text,
                egui::FontId::proportional(22.0),
                Color32::WHITE,
            );
            y -= 26.0;
        }
    }

    fn paint_status(&self, ui: &egui::Ui) {
        let s = self.session.status();
        let clock = match s.duration {
            Some(d) => format!("{:7.2} / {:.2}", s.position, d),
            None => format!("{:7.2}", s.position),
        };
        let av = match s.av_diff {
            Some(d) => format!("A-V:{d:+7.3}"),
            None => "A-V:   n/a".to_string(),
        };
        let line = format!(
            "{}{}  {}  fd={}/{}  aq={:4}KB vq={:4}KB sq={:3}B  vol={:3}{}",
            if s.paused { "|| " } else { "" },
            clock,
            av,
            s.drops_early,
            s.drops_late,
            s.audioq_bytes / 1024,
            s.videoq_bytes / 1024,
            s.subq_bytes,
            s.volume,
            if s.muted { " (mute)" } else { "" },
        );
        let panel = ui.max_rect();
        ui.painter().text(
            Pos2::new(panel.min.x + 8.0, panel.max.y - 8.0),
            egui::Align2::LEFT_BOTTOM,
            line,
            egui::FontId::monospace(12.0),
            Color32::from_gray(190),
        );
    }
}

impl eframe::App for KineApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        if self.interrupted.load(Ordering::SeqCst) {
            self.session.shutdown();
            std::process::exit(123);
        }
        while let Ok(ev) = self.session.events().try_recv() {
            match ev {
                PlayerEvent::Quit => ctx.send_viewport_cmd(egui::ViewportCommand::Close),
                PlayerEvent::Error(msg) => eprintln!("[ui] player error: {msg}"),
            }
        }

        self.handle_keys(ctx);

        let mut remaining = REFRESH_RATE;
        let shared = std::sync::Arc::clone(self.session.shared());
        if let Some(frame) = self.presenter.tick(&shared, &mut remaining) {
            self.upload(ctx, &frame);
        }

        egui::CentralPanel::default()
            .frame(egui::Frame::new().fill(Color32::BLACK))
            .show(ctx, |ui| {
                self.paint_video(ui);
                self.paint_subtitle(ui);
                self.paint_status(ui);
            });

        ctx.request_repaint_after(Duration::from_secs_f64(idle_budget(remaining)));
    }
}
