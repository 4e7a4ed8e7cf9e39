// SPDX-License-Identifier: GPL-2.0-only
pub mod qemu_img;
pub mod traits;
