//! egui front-end for [`DeviceSelector`].
//!
//! Two widgets, both thin renderers of the selector's model:
//!
//! - [`device_menu`] - combo box with *Default* and one entry per device,
//!   hidden when the system has fewer than two devices.
//! - [`restart_dialog`] - [`egui::Modal`] shown once per selection change, with
//!   exactly two buttons: *Close Now* and *Later*.
//!
//! ```ignore
//! egui::TopBottomPanel::top("menu").show(ctx, |ui| {
//!     gpulink_view::device_menu(ui, &mut selector);
//! });
//! let _ = gpulink_view::restart_dialog(ctx, &mut selector);
//! if selector.shall_restart() {
//!     ctx.send_viewport_cmd(egui::ViewportCommand::Close);
//! }
//! ```

use gpulink_core::{DeviceChoice, DeviceSelector};
use tracing::debug;

/// Title of the restart dialog.
pub const RESTART_TITLE: &str = "Restart Required";

/// Body text of the restart dialog.
pub const RESTART_MESSAGE: &str =
    "The selected GPU is used after the application restarts.";

/// Buttons of the restart dialog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogAction {
    /// Close the application now.
    CloseNow,
    /// Keep running; the choice applies at the next start.
    Later,
}

impl DialogAction {
    /// Button label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::CloseNow => "Close Now",
            Self::Later => "Later",
        }
    }

    /// Feed the button press back into the selector.
    pub fn apply(self, selector: &mut DeviceSelector) {
        debug!(action = self.label(), "Restart dialog answered");
        match self {
            Self::CloseNow => selector.restart_close_now(),
            Self::Later => selector.restart_later(),
        }
    }
}

/// Device menu. Returns the new choice when the user picked a different
/// entry; the selector raises the restart request itself.
pub fn device_menu(ui: &mut egui::Ui, selector: &mut DeviceSelector) -> Option<DeviceChoice> {
    let entries = selector.menu_entries()?;
    let current = entries
        .iter()
        .find(|e| e.selected)
        .map_or("Default", |e| e.label.as_str())
        .to_owned();

    let mut picked = None;
    ui.label("GPU:");
    egui::ComboBox::from_id_salt("gpulink_device")
        .selected_text(current)
        .show_ui(ui, |ui| {
            for entry in &entries {
                if ui.selectable_label(entry.selected, &entry.label).clicked() && !entry.selected {
                    picked = Some(entry.choice);
                }
            }
        });

    picked.filter(|&choice| selector.choose_device(choice))
}

/// Id of the restart modal's area.
#[must_use]
pub fn restart_modal_id() -> egui::Id {
    egui::Id::new("gpulink_restart_modal")
}

/// Restart modal. Opens once per pending request and blocks the rest of
/// the UI until one of its buttons is pressed; backdrop clicks and Escape
/// are ignored. Returns the pressed button.
pub fn restart_dialog(ctx: &egui::Context, selector: &mut DeviceSelector) -> Option<DialogAction> {
    if !selector.poll_restart_dialog() {
        return None;
    }

    let response = egui::Modal::new(restart_modal_id()).show(ctx, |ui| {
        ui.heading(RESTART_TITLE);
        ui.label(RESTART_MESSAGE);
        ui.add_space(8.0);
        ui.horizontal(|ui| {
            let mut action = None;
            for a in [DialogAction::CloseNow, DialogAction::Later] {
                if ui.button(a.label()).clicked() {
                    action = Some(a);
                }
            }
            action
        })
        .inner
    });

    let action = response.inner;
    if let Some(action) = action {
        action.apply(selector);
    }
    action
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpulink_core::{DeviceKind, DeviceRegistry, PhysicalDevice, RenderApi};

    fn selector(count: usize) -> DeviceSelector {
        let devices = (0..count)
            .map(|i| PhysicalDevice {
                raw: i as u64,
                name: format!("GPU {i}"),
                vendor_id: 0x10DE,
                kind: DeviceKind::Discrete,
                identity: None,
            })
            .collect();
        let registry = DeviceRegistry::from_devices(RenderApi::Vulkan, devices, Some(0));
        DeviceSelector::new(&registry)
    }

    fn frame(ctx: &egui::Context, selector: &mut DeviceSelector) {
        let _ = ctx.run(egui::RawInput::default(), |ctx| {
            egui::CentralPanel::default().show(ctx, |ui| {
                let _ = device_menu(ui, selector);
            });
            let _ = restart_dialog(ctx, selector);
        });
    }

    #[test]
    fn test_menu_hidden_for_single_device() {
        let ctx = egui::Context::default();
        let mut sel = selector(1);
        let _ = ctx.run(egui::RawInput::default(), |ctx| {
            egui::CentralPanel::default().show(ctx, |ui| {
                assert!(device_menu(ui, &mut sel).is_none());
            });
        });
    }

    #[test]
    fn test_dialog_opens_after_choice() {
        let ctx = egui::Context::default();
        let mut sel = selector(3);
        frame(&ctx, &mut sel);
        assert!(!sel.is_restart_dialog_open());

        assert!(sel.choose_device(DeviceChoice::Device(2)));
        frame(&ctx, &mut sel);
        assert!(sel.is_restart_dialog_open());
        assert!(!sel.restart_requested());

        // Stays open across frames until answered.
        frame(&ctx, &mut sel);
        assert!(sel.is_restart_dialog_open());
    }

    #[test]
    fn test_dialog_is_top_modal_while_open() {
        let ctx = egui::Context::default();
        let mut sel = selector(2);
        sel.choose_device(DeviceChoice::Device(1));
        // egui promotes a modal to the top layer at the next frame boundary.
        let mut top = None;
        for _ in 0..2 {
            let _ = ctx.run(egui::RawInput::default(), |ctx| {
                egui::CentralPanel::default().show(ctx, |ui| {
                    let _ = device_menu(ui, &mut sel);
                });
                assert_eq!(restart_dialog(ctx, &mut sel), None);
                top = ctx.memory(|m| m.top_modal_layer()).map(|layer| layer.id);
            });
        }
        assert_eq!(top, Some(restart_modal_id()));
        assert!(sel.is_restart_dialog_open());
    }

    #[test]
    fn test_no_modal_without_request() {
        let ctx = egui::Context::default();
        let mut sel = selector(2);
        let _ = ctx.run(egui::RawInput::default(), |ctx| {
            assert_eq!(restart_dialog(ctx, &mut sel), None);
            assert!(ctx.memory(|m| m.top_modal_layer()).is_none());
        });
    }

    #[test]
    fn test_close_now_requests_restart() {
        let mut sel = selector(2);
        sel.choose_device(DeviceChoice::Device(1));
        sel.poll_restart_dialog();
        DialogAction::CloseNow.apply(&mut sel);
        assert!(!sel.is_restart_dialog_open());
        assert!(sel.shall_restart());
    }

    #[test]
    fn test_later_only_dismisses() {
        let ctx = egui::Context::default();
        let mut sel = selector(2);
        sel.choose_device(DeviceChoice::Device(0));
        frame(&ctx, &mut sel);
        DialogAction::Later.apply(&mut sel);
        frame(&ctx, &mut sel);
        assert!(!sel.is_restart_dialog_open());
        assert!(!sel.shall_restart());
        assert_eq!(sel.current(), DeviceChoice::Device(0));
    }

    #[test]
    fn test_button_labels() {
        assert_eq!(DialogAction::CloseNow.label(), "Close Now");
        assert_eq!(DialogAction::Later.label(), "Later");
    }
}
