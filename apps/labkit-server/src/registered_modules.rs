// Links every module crate so its inventory registrations are collected by
// `PluginRegistry::discover`. Add new module crates here.
#![allow(unused_imports)]

use dummy_instruments as _;
