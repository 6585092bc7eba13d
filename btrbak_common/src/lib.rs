// btrbak_common is the shared library implementing the backup engine logic.
// Copyright (C) 2024  Himbeer <himbeerserverde@gmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

mod error;
pub use error::*;

pub mod blockdev;
pub mod config;
pub mod driver;
pub mod image;
pub mod lock;
pub mod metadata;
pub mod pool;
pub mod remote;
pub mod retention;
pub mod system;
pub mod transfer;
