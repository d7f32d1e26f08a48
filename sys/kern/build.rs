// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::env;

/// Exposes the CPU's M-profile architecture version as `cfg(armv6m)` /
/// `cfg(armv7m)`. This isn't available in rustc's standard environment, and
/// the context-switch and timer code need to branch on it.
fn main() {
    println!("cargo:rustc-check-cfg=cfg(armv6m)");
    println!("cargo:rustc-check-cfg=cfg(armv7m)");

    let target = env::var("TARGET").unwrap();
    if target.starts_with("thumbv6m") {
        println!("cargo:rustc-cfg=armv6m");
    } else if target.starts_with("thumbv7m") || target.starts_with("thumbv7em")
    {
        println!("cargo:rustc-cfg=armv7m");
    }
}
